//! Error types for the tankfeed core library.
//!
//! One top-level enum covers the whole pipeline. Per-source failures are
//! caught at the source boundary by the registry; connection failures are
//! caught per subscriber by the broadcast hub.

use thiserror::Error;

/// Result type alias for tankfeed operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for tankfeed.
#[derive(Error, Debug)]
pub enum Error {
    /// Source descriptor rejected at registration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Content could not be classified into a format
    #[error("Format detection failed: {0}")]
    FormatDetection(String),

    /// Content is malformed for the detected or declared format
    #[error("Parse error ({format}): {message}")]
    Parse { format: String, message: String },

    /// Mapping table cannot be resolved
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// File or network read failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote fetch failure
    #[error("HTTP error: {message}")]
    Http { message: String, transient: bool },

    /// Subscriber transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a parse error for the given format.
    pub fn parse(format: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is expected to clear on its own by the next tick.
    ///
    /// Transient errors are retried silently until they repeat often enough
    /// to be reported.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::PermissionDenied
            ),
            Error::Http { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Short category label used in events and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::FormatDetection(_) => "format",
            Error::Parse { .. } => "parse",
            Error::Mapping(_) => "mapping",
            Error::Io(_) => "io",
            Error::Http { .. } => "http",
            Error::Connection(_) => "connection",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        Error::Http {
            message: err.to_string(),
            transient,
        }
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::parse("csv", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Validation("source id is required".into());
        assert_eq!(err.to_string(), "Validation error: source id is required");

        let err = Error::parse("json", "expected value at line 1");
        assert_eq!(
            err.to_string(),
            "Parse error (json): expected value at line 1"
        );
    }

    #[test]
    fn test_transient_classification() {
        let missing: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(missing.is_transient());

        let broken: Error = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad").into();
        assert!(!broken.is_transient());

        assert!(!Error::parse("xml", "unclosed tag").is_transient());
        assert!(Error::Http {
            message: "timed out".into(),
            transient: true
        }
        .is_transient());
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err: Error = toml::from_str::<toml::Value>("a = ").unwrap_err().into();
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
