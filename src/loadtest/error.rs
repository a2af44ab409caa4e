//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for configuration and reporting errors, and
//! [`ScenarioError`] for transport failures raised by work units while the
//! test is running.

/// Errors that occur during load test configuration parsing, validation, or file I/O.
///
/// Every variant except [`LoadTestError::Report`] is raised before the first
/// virtual user starts; none of them is produced mid-run.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (empty stage list, weights not summing to 1.0,
    /// malformed threshold expression, ...).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The run summary could not be rendered or written.
    #[error("Failed to write report: {message}")]
    Report { message: String },
}

impl LoadTestError {
    /// Shorthand for a [`LoadTestError::ConfigValidation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`LoadTestError::Report`] error.
    pub fn report(message: impl Into<String>) -> Self {
        Self::Report {
            message: message.into(),
        }
    }
}

/// Transport-level failures returned by a work unit.
///
/// These never stop the run: the scenario runner counts them as failed
/// iterations and the virtual user carries on. A response with any status,
/// 4xx and 5xx included, is not an error here; checks judge it.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ScenarioError {
    /// The request exceeded the configured per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The work unit panicked. The panic is caught at the iteration boundary.
    #[error("Work unit panicked: {message}")]
    Panicked { message: String },
}

impl ScenarioError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"timeout"`, `"connection"`, `"panic"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection { .. } => "connection",
            Self::Panicked { .. } => "panic",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`ScenarioError`] variant.
    ///
    /// Anything that is not a timeout (connect, TLS, body read) counts as a
    /// connection failure.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_timeout() {
        assert_eq!(ScenarioError::Timeout.error_category(), "timeout");
    }

    #[test]
    fn test_error_category_connection() {
        let err = ScenarioError::Connection {
            message: "DNS resolution failed".to_string(),
        };
        assert_eq!(err.error_category(), "connection");
    }

    #[test]
    fn test_error_category_panic() {
        let err = ScenarioError::Panicked {
            message: "boom".to_string(),
        };
        assert_eq!(err.error_category(), "panic");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_validation_shorthand() {
        let err = LoadTestError::validation("empty stage list");
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
        assert_eq!(
            err.to_string(),
            "Config validation error: empty stage list"
        );
    }
}
