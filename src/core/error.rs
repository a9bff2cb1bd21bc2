//! Unified error type for the Apiary engine
//!
//! Covers the failure modes of both cores: playbook validation and
//! execution on one side, rule storage and evaluation on the other.
//! Subsystem modules use `anyhow` internally; this enum is the typed
//! surface for the storage layer and library boundary.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Apiary operations
#[derive(Error, Debug)]
pub enum EngineError {
    // Playbook errors
    /// Playbook failed structural validation
    #[error("Playbook validation failed: {message}")]
    PlaybookValidation { message: String },

    /// Playbook execution failed at the run level
    #[error("Playbook execution failed: {message}")]
    PlaybookExecution { message: String },

    /// Execution plan could not be resolved
    #[error("Cannot resolve dependencies for steps: {steps:?}")]
    UnresolvableDependencies { steps: Vec<String> },

    /// Referenced execution does not exist
    #[error("Execution not found: {run_id}")]
    ExecutionNotFound { run_id: String },

    // Rule errors
    /// Rule failed validation
    #[error("Rule validation failed: {message}")]
    RuleValidation { message: String },

    /// Referenced rule does not exist
    #[error("Rule not found: {id}")]
    RuleNotFound { id: String },

    /// Referenced rule template does not exist
    #[error("Rule template not found: {id}")]
    TemplateNotFound { id: String },

    /// Template parameter rejected during instantiation
    #[error("Invalid template parameter '{name}': {message}")]
    TemplateParameter { name: String, message: String },

    /// Rule inheritance chain is invalid
    #[error("Invalid rule inheritance: {message}")]
    Inheritance { message: String },

    // Storage errors
    /// Database connection or pool failure
    #[error("Database connection failed: {message}")]
    DatabaseConnection { message: String },

    /// Database query failure
    #[error("Database query failed: {message}")]
    DatabaseQuery { message: String },

    // Configuration errors
    /// Configuration file not found
    #[error("Configuration file not found at {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration content
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    // Generic errors with context
    /// Serialization or deserialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal error with context
    #[error("Internal error in {context}: {message}")]
    Internal { context: String, message: String },
}

impl EngineError {
    /// Create a playbook validation error
    pub fn playbook_validation(message: impl Into<String>) -> Self {
        Self::PlaybookValidation {
            message: message.into(),
        }
    }

    /// Create a playbook execution error
    pub fn playbook_execution(message: impl Into<String>) -> Self {
        Self::PlaybookExecution {
            message: message.into(),
        }
    }

    /// Create a rule validation error
    pub fn rule_validation(message: impl Into<String>) -> Self {
        Self::RuleValidation {
            message: message.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> ErrorKind {
        match self {
            Self::PlaybookValidation { .. }
            | Self::UnresolvableDependencies { .. }
            | Self::RuleValidation { .. }
            | Self::TemplateParameter { .. }
            | Self::Inheritance { .. } => ErrorKind::Validation,

            Self::PlaybookExecution { .. } | Self::ExecutionNotFound { .. } => ErrorKind::Execution,

            Self::RuleNotFound { .. }
            | Self::TemplateNotFound { .. }
            | Self::DatabaseConnection { .. }
            | Self::DatabaseQuery { .. } => ErrorKind::Storage,

            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } => ErrorKind::Configuration,

            Self::Serialization { .. } | Self::Internal { .. } => ErrorKind::System,
        }
    }
}

/// Coarse error classification for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, bad playbook or rule definitions
    Validation,
    /// Run-level execution failures
    Execution,
    /// Rule store and persistence failures
    Storage,
    /// Engine configuration problems
    Configuration,
    /// Everything else
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Execution => write!(f, "execution"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::System => write!(f, "system"),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::Internal {
            context: "io".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigInvalid {
            message: format!("TOML parsing error: {}", err),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::DatabaseQuery {
            message: err.to_string(),
        }
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(err: r2d2::Error) -> Self {
        Self::DatabaseConnection {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for EngineError {
    fn from(err: chrono::ParseError) -> Self {
        Self::Internal {
            context: "time".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Apiary operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = EngineError::playbook_validation("missing steps");
        assert_eq!(err.category(), ErrorKind::Validation);

        let err = EngineError::RuleNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(err.category(), ErrorKind::Storage);
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::UnresolvableDependencies {
            steps: vec!["s2".to_string()],
        };
        assert!(err.to_string().contains("s2"));
    }
}
