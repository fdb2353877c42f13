//! Harness configuration
//!
//! [`HarnessConfig`] carries the constants a test case is built with. Values
//! that may change while a test runs (the timeout override) are read through an
//! [`OverrideSource`] at the moment they are needed.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied when a caller does not give one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration key consulted for the timeout override
pub const DEFAULT_OVERRIDE_KEY: &str = "TIMEOUT";

/// Where timeout overrides come from
pub trait OverrideSource: Send + Sync {
    /// Current raw value for `key`, if set
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads overrides from the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl OverrideSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory override values; may be changed while a test runs
#[derive(Debug, Default)]
pub struct StaticSource {
    values: RwLock<HashMap<String, String>>,
}

impl StaticSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source holding a single value
    pub fn with(key: impl Into<String>, value: impl Into<String>) -> Self {
        let source = Self::new();
        source.set(key, value);
        source
    }

    /// Set or replace a value
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Remove a value, returning the old one
    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }
}

impl OverrideSource for StaticSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

static ENV_SOURCE: Lazy<Arc<dyn OverrideSource>> = Lazy::new(|| Arc::new(EnvSource));

/// Shared environment-backed source used by [`HarnessConfig::default`]
pub fn env_source() -> Arc<dyn OverrideSource> {
    Arc::clone(&ENV_SOURCE)
}

/// Configuration for a test case and its timeout resolution
#[derive(Clone)]
pub struct HarnessConfig {
    /// Fallback used when no explicit timeout is given
    pub default_timeout: Duration,
    /// Key looked up in the override source
    pub override_key: String,
    /// Source of the timeout override
    pub overrides: Arc<dyn OverrideSource>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            override_key: DEFAULT_OVERRIDE_KEY.to_string(),
            overrides: env_source(),
        }
    }
}

impl HarnessConfig {
    /// Replace the override source
    pub fn with_overrides(mut self, overrides: Arc<dyn OverrideSource>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Replace the default timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Replace the override key
    pub fn with_override_key(mut self, key: impl Into<String>) -> Self {
        self.override_key = key.into();
        self
    }
}

impl std::fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("default_timeout", &self.default_timeout)
            .field("override_key", &self.override_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.override_key, "TIMEOUT");
    }

    #[test]
    fn test_static_source_mutation() {
        let source = StaticSource::with("TIMEOUT", "0.1");
        assert_eq!(source.get("TIMEOUT").as_deref(), Some("0.1"));

        source.set("TIMEOUT", "2");
        assert_eq!(source.get("TIMEOUT").as_deref(), Some("2"));

        assert_eq!(source.remove("TIMEOUT").as_deref(), Some("2"));
        assert!(source.get("TIMEOUT").is_none());
    }

    #[test]
    fn test_env_source_reads_process_environment() {
        let key = "LOOP_HARNESS_CONFIG_TEST_ENV_SOURCE";
        std::env::set_var(key, "1.5");
        assert_eq!(EnvSource.get(key).as_deref(), Some("1.5"));
        std::env::remove_var(key);
        assert!(EnvSource.get(key).is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = HarnessConfig::default()
            .with_default_timeout(Duration::from_millis(250))
            .with_override_key("ASYNC_TEST_TIMEOUT")
            .with_overrides(Arc::new(StaticSource::new()));
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.override_key, "ASYNC_TEST_TIMEOUT");
        assert!(config.overrides.get("ASYNC_TEST_TIMEOUT").is_none());
    }
}
