//! Error types for the RLS engine

use thiserror::Error;

/// RLS engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Policy Administration Errors
    #[error("Policy '{name}' already exists on table '{table}'")]
    DuplicatePolicyName { table: String, name: String },

    #[error("Policy '{name}' not found on table '{table}'")]
    PolicyNotFound { table: String, name: String },

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    // Evaluation Errors
    #[error("Predicate evaluation error: {0}")]
    PredicateEvaluationError(String),

    #[error("Policy recursion limit exceeded (max depth {max_depth})")]
    PolicyRecursionLimitExceeded { max_depth: u32 },

    // Authorization Errors
    #[error("New row violates row-level security policy for table '{table}' ({operation})")]
    PolicyCheckViolation { table: String, operation: String },

    // Storage Errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    // General Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for RLS operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a predicate evaluation failure
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::PredicateEvaluationError(message.into())
    }

    /// Shorthand for a write rejected by a policy check
    pub fn check_violation(table: &str, operation: impl std::fmt::Display) -> Self {
        Self::PolicyCheckViolation {
            table: table.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Whether this error is the expected "not authorized" outcome of a write,
    /// as opposed to a system or policy-authoring failure.
    #[must_use]
    pub fn is_policy_denial(&self) -> bool {
        matches!(self, Self::PolicyCheckViolation { .. })
    }

    /// HTTP status code for each error type
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidPolicy(_) | Self::InvalidQuery(_) => 400,

            // 403 Forbidden
            Self::PolicyCheckViolation { .. } => 403,

            // 404 Not Found
            Self::PolicyNotFound { .. } | Self::TableNotFound(_) => 404,

            // 409 Conflict
            Self::DuplicatePolicyName { .. } => 409,

            // 500 Internal Server Error
            Self::PredicateEvaluationError(_)
            | Self::PolicyRecursionLimitExceeded { .. }
            | Self::ConfigError(_)
            | Self::InternalError(_)
            | Self::IoError(_)
            | Self::JsonError(_) => 500,
        }
    }

    /// Stable error code for API responses
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicatePolicyName { .. } => "duplicate_policy_name",
            Self::PolicyNotFound { .. } => "policy_not_found",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::PredicateEvaluationError(_) => "predicate_evaluation_error",
            Self::PolicyRecursionLimitExceeded { .. } => "policy_recursion_limit",
            Self::PolicyCheckViolation { .. } => "rls_violation",
            Self::TableNotFound(_) => "table_not_found",
            Self::InvalidQuery(_) => "invalid_query",
            Self::ConfigError(_) => "config_error",
            Self::InternalError(_) => "internal_error",
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let dup = Error::DuplicatePolicyName {
            table: "profiles".to_string(),
            name: "p".to_string(),
        };
        assert_eq!(dup.status_code(), 409);
        assert_eq!(Error::check_violation("profiles", "UPDATE").status_code(), 403);
        assert_eq!(Error::evaluation("boom").status_code(), 500);
        assert_eq!(
            Error::PolicyRecursionLimitExceeded { max_depth: 4 }.status_code(),
            500
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::check_violation("t", "INSERT").error_code(), "rls_violation");
        assert_eq!(
            Error::PolicyNotFound {
                table: "t".to_string(),
                name: "p".to_string()
            }
            .error_code(),
            "policy_not_found"
        );
    }

    #[test]
    fn test_denial_is_distinct_from_failure() {
        assert!(Error::check_violation("t", "INSERT").is_policy_denial());
        assert!(!Error::evaluation("missing column").is_policy_denial());
        assert!(!Error::PolicyRecursionLimitExceeded { max_depth: 1 }.is_policy_denial());
    }
}
