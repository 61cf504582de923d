//! Calculation core error types
//!
//! One error enum for the whole core. Engine operations return
//! `Result<T, CoreError>`; only `Fatal` is treated as unrecoverable by the
//! pipeline (the shard logs, increments the failure metric and continues).

use thiserror::Error;

/// Calculation core error
///
/// Error codes match the event-bus dead-letter contract and the REST
/// facade's status mapping.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // === Input contract violations ===
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Position event without start-of-day authority for {0}")]
    ConflictingAuthority(String),

    #[error("Quantity must be non-negative: {0}")]
    NegativeQuantity(String),

    // === Missing references ===
    #[error("Unknown security: {0}")]
    UnknownSecurity(String),

    #[error("Unknown book: {0}")]
    UnknownBook(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    // === Concurrency ===
    #[error("Version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    // === Deadlines ===
    #[error("Deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),

    // === Collaborator failures ===
    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("Rule store unavailable: {0}")]
    RuleStoreUnavailable(String),

    // === Broken invariants ===
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
}

/// Coarse error kind, used for propagation policy and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Timeout,
    Dependency,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Dependency => "DEPENDENCY",
            ErrorKind::Fatal => "FATAL",
        }
    }
}

impl CoreError {
    /// Classify into the propagation-policy kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MissingField(_)
            | CoreError::InvalidField { .. }
            | CoreError::ConflictingAuthority(_)
            | CoreError::NegativeQuantity(_) => ErrorKind::Validation,
            CoreError::UnknownSecurity(_) | CoreError::UnknownBook(_) | CoreError::NotFound(_) => {
                ErrorKind::NotFound
            }
            CoreError::VersionConflict { .. } => ErrorKind::Conflict,
            CoreError::DeadlineExceeded(_) => ErrorKind::Timeout,
            CoreError::RepositoryUnavailable(_) | CoreError::RuleStoreUnavailable(_) => {
                ErrorKind::Dependency
            }
            CoreError::InvariantViolated(_) => ErrorKind::Fatal,
        }
    }

    /// Get the error code for dead-letter records and API responses
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Get HTTP status code suggestion for the REST facade
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Dependency => 503,
            ErrorKind::Fatal => 500,
        }
    }

    /// True when the event-path should park the event and retry with back-off
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Dependency)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::RepositoryUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::MissingField("bookId").code(), "VALIDATION");
        assert_eq!(CoreError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            CoreError::VersionConflict {
                entity: "position".into(),
                expected: 2,
                found: 3
            }
            .code(),
            "CONFLICT"
        );
        assert_eq!(CoreError::DeadlineExceeded(200).code(), "TIMEOUT");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(CoreError::MissingField("securityId").http_status(), 400);
        assert_eq!(CoreError::UnknownBook("B1".into()).http_status(), 404);
        assert_eq!(CoreError::DeadlineExceeded(150).http_status(), 504);
        assert_eq!(
            CoreError::InvariantViolated("negative remaining".into()).http_status(),
            500
        );
    }

    #[test]
    fn test_retryable() {
        assert!(CoreError::UnknownSecurity("S1".into()).is_retryable());
        assert!(CoreError::RepositoryUnavailable("down".into()).is_retryable());
        assert!(!CoreError::MissingField("qty").is_retryable());
    }
}
