//! Effective timeout resolution
//!
//! A timeout is combined from three inputs: the caller's explicit value, the
//! configured default, and an override read from an [`OverrideSource`]. The
//! override can only extend a timeout, which lets slow environments raise every
//! bound without editing tests.

use crate::config::{HarnessConfig, OverrideSource};
use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// The inputs of one timeout resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutSpec {
    /// Caller-provided timeout
    pub explicit: Option<Duration>,
    /// Override read from configuration at resolution time
    pub override_: Option<Duration>,
    /// Fallback when no explicit timeout is given
    pub default: Duration,
}

impl TimeoutSpec {
    /// `max(explicit or default, override or zero)`
    pub fn effective(&self) -> Duration {
        let base = self.explicit.unwrap_or(self.default);
        base.max(self.override_.unwrap_or(Duration::ZERO))
    }
}

/// Resolves effective timeouts against a live override source
#[derive(Clone)]
pub struct TimeoutResolver {
    source: Arc<dyn OverrideSource>,
    key: String,
    default: Duration,
}

impl TimeoutResolver {
    /// Create a resolver from explicit parts
    pub fn new(source: Arc<dyn OverrideSource>, key: impl Into<String>, default: Duration) -> Self {
        Self {
            source,
            key: key.into(),
            default,
        }
    }

    /// Create a resolver from a harness configuration
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            Arc::clone(&config.overrides),
            config.override_key.clone(),
            config.default_timeout,
        )
    }

    /// Default used when no explicit timeout is given
    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    /// Read and parse the override; unusable values count as no override
    pub fn override_timeout(&self) -> Option<Duration> {
        let raw = self.source.get(&self.key)?;
        match parse_seconds(&raw) {
            Ok(duration) => Some(duration),
            Err(reason) => {
                let err = Error::Configuration {
                    key: self.key.clone(),
                    value: raw,
                    reason,
                };
                log::warn!("{}; ignoring override", err);
                None
            }
        }
    }

    /// Snapshot the resolution inputs for `explicit`
    pub fn spec(&self, explicit: Option<Duration>) -> TimeoutSpec {
        TimeoutSpec {
            explicit,
            override_: self.override_timeout(),
            default: self.default,
        }
    }

    /// Resolve the timeout actually enforced for `explicit`
    pub fn resolve(&self, explicit: Option<Duration>) -> Duration {
        self.spec(explicit).effective()
    }
}

impl Default for TimeoutResolver {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl std::fmt::Debug for TimeoutResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutResolver")
            .field("key", &self.key)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

fn parse_seconds(raw: &str) -> std::result::Result<Duration, String> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("not a number of seconds ({})", e))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}
