//! Error types for the bridge.

use crate::runtime::registry::OpHandle;
use std::fmt;
use std::thread::ThreadId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the bridge error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A script exception captured at the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Error constructor name (`TypeError`, `Error`, ...), when the thrown value had one.
    pub name: Option<String>,
    pub message: String,
    /// Engine stack trace, when the engine produced one.
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum Error {
    /// A value has no representation on the other side of the boundary.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// An engine value was touched from a thread that does not own the engine.
    #[error("Thread violation: engine owned by {expected:?}, accessed from {actual:?}")]
    ThreadViolation { expected: ThreadId, actual: ThreadId },

    /// Script threw during execution.
    #[error("Script error: {0}")]
    Script(ScriptError),

    /// The runtime is closing or closed.
    #[error("Runtime has been closed")]
    Closed,

    /// A bridge handle is no longer registered.
    #[error("Handle not found: {0}")]
    HandleNotFound(OpHandle),

    /// Script execution exceeded the configured timeout.
    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by a host transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Runtime thread or channel failure.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Create a conversion error.
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Create a script error carrying only a message.
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script(ScriptError::new(message))
    }

    /// Build a thread violation and report it loudly.
    pub fn thread_violation(expected: ThreadId, actual: ThreadId) -> Self {
        tracing::error!(
            target: "jsbridge::thread",
            ?expected,
            ?actual,
            "engine value accessed off the execution thread"
        );
        Self::ThreadViolation { expected, actual }
    }

    /// Stable code attached to errors thrown into script as `err.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conversion(_) => "ERR_CONVERSION",
            Self::ThreadViolation { .. } => "ERR_THREAD_VIOLATION",
            Self::Script(_) => "ERR_SCRIPT",
            Self::Closed => "ERR_CLOSED",
            Self::HandleNotFound(_) => "ERR_HANDLE_NOT_FOUND",
            Self::Timeout(_) => "ERR_TIMEOUT",
            Self::Config(_) => "ERR_CONFIG",
            Self::Transport(_) => "ERR_TRANSPORT",
            Self::Runtime(_) => "ERR_RUNTIME",
        }
    }

    /// Whether this is a thread-confinement bug rather than a runtime condition.
    pub fn is_thread_violation(&self) -> bool {
        matches!(self, Self::ThreadViolation { .. })
    }

    /// The captured script exception, if this error came from script.
    pub fn as_script(&self) -> Option<&ScriptError> {
        match self {
            Self::Script(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Conversion(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let err = Error::Script(ScriptError {
            name: Some("TypeError".to_string()),
            message: "x is not a function".to_string(),
            stack: None,
        });
        assert_eq!(err.to_string(), "Script error: TypeError: x is not a function");
        assert_eq!(err.as_script().map(|s| s.message.as_str()), Some("x is not a function"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Execution timed out after 250ms");
    }

    #[test]
    fn test_handle_not_found_display() {
        let err = Error::HandleNotFound(OpHandle::from_raw(7));
        assert_eq!(err.to_string(), "Handle not found: op#7");
    }

    #[test]
    fn test_thread_violation_flag() {
        let here = std::thread::current().id();
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let err = Error::thread_violation(here, other);
        assert!(err.is_thread_violation());
        assert!(!Error::Closed.is_thread_violation());
    }
}
