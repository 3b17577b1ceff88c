//! Error handling for the getwork gateway
//!
//! Errors raised by upstream calls, configuration loading and the serving
//! socket. Request-scoped protocol failures are not errors here; they travel
//! as [`crate::protocol::ErrorReply`] values inside a JSON-RPC response.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport errors talking to an upstream
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Upstream node answered with an error object or unusable payload
    #[error("Upstream {upstream} error: {message}")]
    Upstream { upstream: String, message: String },

    /// Upstream call exceeded its timeout
    #[error("Upstream {upstream} timed out after {millis}ms")]
    Timeout { upstream: String, millis: u128 },

    /// Malformed work fields (header, seed, target)
    #[error("Work error: {message}")]
    Work { message: String },

    /// Line framing violations on a miner connection
    #[error("Framing error: {message}")]
    Framing { message: String },

    /// Serving socket errors
    #[error("Server error: {message}")]
    Server { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            message: message.into(),
        }
    }

    /// Create an upstream timeout error
    pub fn timeout(upstream: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            upstream: upstream.into(),
            millis: after.as_millis(),
        }
    }

    /// Create a work error
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work {
            message: message.into(),
        }
    }

    /// Create a framing error
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Create a server error
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Whether the failure says something about upstream health.
    ///
    /// A node that answers `false` to a submission is healthy; a node that
    /// times out or refuses the connection is not.
    pub fn is_upstream_fault(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout { .. } | Error::Upstream { .. } => true,
            Error::Json(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Upstream { .. } => "upstream",
            Error::Timeout { .. } => "timeout",
            Error::Work { .. } => "work",
            Error::Framing { .. } => "framing",
            Error::Server { .. } => "server",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing upstream");
        assert_eq!(err.to_string(), "Configuration error: missing upstream");

        let err = Error::upstream("main", "header not found");
        assert_eq!(err.to_string(), "Upstream main error: header not found");

        let err = Error::timeout("backup", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Upstream backup timed out after 1500ms");
    }

    #[test]
    fn test_upstream_fault_classification() {
        assert!(Error::timeout("a", Duration::from_secs(1)).is_upstream_fault());
        assert!(Error::upstream("a", "boom").is_upstream_fault());
        assert!(!Error::config("bad").is_upstream_fault());
        assert!(!Error::framing("flood").is_upstream_fault());
    }

    #[test]
    fn test_error_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.category(), "io");

        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.category(), "json");
    }
}
