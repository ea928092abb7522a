//! Runtime configuration for a single engine instance.
//!
//! This module defines the configuration structure for runtimes, including
//! heap limits, bootstrap options, conversion limits and shutdown bounds.

use crate::error::{Error, Result};
use crate::runtime::value::{MAX_JS_BYTES, MAX_JS_DEPTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default name of the execution thread.
pub const DEFAULT_THREAD_NAME: &str = "jsbridge-runtime";

/// Default bound on how long `close` waits for the execution thread to drain.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration for a single engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Optional timeout for script execution
    #[serde(with = "option_millis", rename = "execution_timeout_ms")]
    pub execution_timeout: Option<Duration>,

    /// Bootstrap script to run on startup, after the built-in globals
    pub bootstrap_script: Option<String>,

    /// Route `console.*` to tracing (default: true)
    pub enable_console: bool,

    /// Name given to the execution thread
    pub thread_name: String,

    /// How long `close` waits for queued work to drain
    #[serde(with = "millis", rename = "close_timeout_ms")]
    pub close_timeout: Duration,

    /// Maximum nesting depth for value conversion
    pub max_conversion_depth: usize,

    /// Maximum size in bytes for a single value conversion
    pub max_conversion_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            execution_timeout: None,
            bootstrap_script: None,
            enable_console: true,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_conversion_depth: MAX_JS_DEPTH,
            max_conversion_bytes: MAX_JS_BYTES,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_conversion_limits(mut self, max_depth: usize, max_bytes: usize) -> Self {
        self.max_conversion_depth = max_depth;
        self.max_conversion_bytes = max_bytes;
        self
    }

    /// Check the configuration before an engine is built from it.
    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(Error::config(
                "initial_heap_size requires max_heap_size to be set as well",
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(Error::config(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.execution_timeout == Some(Duration::ZERO) {
            return Err(Error::config("execution_timeout must be greater than zero"));
        }

        if self.close_timeout.is_zero() {
            return Err(Error::config("close_timeout must be greater than zero"));
        }

        if self.thread_name.trim().is_empty() {
            return Err(Error::config("thread_name cannot be empty"));
        }

        if self.max_conversion_depth == 0 || self.max_conversion_bytes == 0 {
            return Err(Error::config("conversion limits must be greater than zero"));
        }

        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.execution_timeout.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.enable_console);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert_eq!(config.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert_eq!(config.max_conversion_depth, MAX_JS_DEPTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_execution_timeout(Duration::from_secs(30))
            .with_console(false)
            .with_thread_name("worker-1");

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(30)));
        assert!(!config.enable_console);
        assert_eq!(config.thread_name, "worker-1");
    }

    #[test]
    fn test_initial_heap_requires_max() {
        let config = RuntimeConfig::new().with_initial_heap_size(1024);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires max_heap_size"));
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max() {
        let config = RuntimeConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(RuntimeConfig::new()
            .with_conversion_limits(0, 10)
            .validate()
            .is_err());
        assert!(RuntimeConfig::new()
            .with_close_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RuntimeConfig::new()
            .with_execution_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let config = RuntimeConfig::new().with_execution_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["execution_timeout_ms"], 1500);
        assert_eq!(json["close_timeout_ms"], 5000);

        let parsed: RuntimeConfig =
            serde_json::from_str(r#"{"execution_timeout_ms": 250, "enable_console": false}"#)
                .unwrap();
        assert_eq!(parsed.execution_timeout, Some(Duration::from_millis(250)));
        assert!(!parsed.enable_console);
        assert_eq!(parsed.thread_name, DEFAULT_THREAD_NAME);
    }
}
