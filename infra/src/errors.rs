//! Error handling for the task lists stack definition.
//!
//! Every fallible step of building, synthesizing or auditing the stack reports
//! an [`InfraError`]. Binaries wrap these in `anyhow` with added context.

use thiserror::Error;

/// Main error type for stack construction and synthesis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfraError {
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value handed to a resource constructor is not acceptable
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field or property name
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// An environment value was left as a placeholder
    #[error("Environment variable {name} holds a placeholder value {value:?}")]
    Placeholder {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },

    /// Two resources were declared with the same logical id
    #[error("Duplicate logical id: {0}")]
    DuplicateResource(String),

    /// A user lifecycle transition that the directory never performs
    #[error("Invalid user status transition from {from} on {event}")]
    InvalidTransition {
        /// Status before the event
        from: String,
        /// Event name
        event: String,
    },

    /// The audit found error-severity findings
    #[error("Stack audit failed with {0} error(s)")]
    AuditFailed(usize),

    /// Template serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for stack operations.
pub type InfraResult<T> = Result<T, InfraError>;

impl InfraError {
    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates an invalid value error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = InfraError::invalid("TableName", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Invalid value for TableName: must not be empty"
        );

        let err = InfraError::Placeholder {
            name: "USER_POOL_ID".to_string(),
            value: "USER_POOL_ID".to_string(),
        };
        assert!(err.to_string().contains("USER_POOL_ID"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: InfraError = parse_err.into();
        assert!(matches!(err, InfraError::Serialization(_)));
    }
}
