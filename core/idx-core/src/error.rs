//! Error types for the IDX record store.
//!
//! All public APIs return `IdxResult<T>` — no panics in library code.
//! Errors are kinds: backend failures are folded into this enum through a
//! fixed name → kind mapping (see [`IdxError::from_engine`]).

use thiserror::Error;

use crate::engine::EngineError;

/// Unified error type for all IDX operations.
#[derive(Debug, Error)]
pub enum IdxError {
    /// Uniqueness or primary-key constraint violation
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Requested index or record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Requested table does not exist
    #[error("table '{0}' not found")]
    InvalidTable(String),

    /// Value is not usable as a key, or key extraction failed
    #[error("data error: {0}")]
    Data(String),

    /// Transaction was aborted
    #[error("transaction aborted: {0}")]
    Abort(String),

    /// Backend lacks a required capability
    #[error("missing backend capability: {0}")]
    MissingApi(String),

    /// Schema definition or migration error
    #[error("schema error: {0}")]
    Schema(String),

    /// Open is blocked by another connection
    #[error("open blocked: {0}")]
    Blocked(String),

    /// Version conflict between connections
    #[error("version conflict: {0}")]
    VersionChange(String),

    /// Database handle has been closed
    #[error("database is closed")]
    DatabaseClosed,

    /// Record could not be cloned for storage
    #[error("record not cloneable: {0}")]
    DataClone(String),

    /// Invalid access (wrong transaction scope, wrong handle)
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// Backend failed to open the database
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// Backend storage quota exceeded
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Write attempted in a read-only transaction
    #[error("read-only transaction: {0}")]
    ReadOnly(String),

    /// Backend-raised timeout
    #[error("backend timeout: {0}")]
    Timeout(String),

    /// Operation on a finished or inactive transaction
    #[error("transaction inactive: {0}")]
    TransactionInactive(String),

    /// One or more event listeners failed during dispatch
    #[error("event listener failure: {0}")]
    Listener(String),

    /// Unmapped backend error — original name and message preserved
    #[error("{name}: {message}")]
    Unknown { name: String, message: String },
}

/// Result type alias for all IDX operations.
pub type IdxResult<T> = Result<T, IdxError>;

impl IdxError {
    /// Map a backend error to an error kind.
    ///
    /// The mapping is a fixed table keyed by the backend's error name.
    /// Unmapped names surface as [`IdxError::Unknown`] with the original
    /// name and message preserved.
    pub fn from_engine(err: EngineError) -> Self {
        let EngineError { name, message } = err;
        match &*name {
            "ConstraintError" => IdxError::Constraint(message),
            "NotFoundError" => IdxError::NotFound(message),
            "InvalidStateError" => IdxError::InvalidState(message),
            "DataError" => IdxError::Data(message),
            "AbortError" => IdxError::Abort(message),
            "QuotaExceededError" => IdxError::QuotaExceeded(message),
            "ReadOnlyError" => IdxError::ReadOnly(message),
            "TimeoutError" => IdxError::Timeout(message),
            "TransactionInactiveError" => IdxError::TransactionInactive(message),
            "VersionError" => IdxError::VersionChange(message),
            "InvalidAccessError" => IdxError::InvalidAccess(message),
            "DataCloneError" => IdxError::DataClone(message),
            "BlockedError" => IdxError::Blocked(message),
            "OpenFailedError" => IdxError::OpenFailed(message),
            "MissingAPIError" => IdxError::MissingApi(message),
            "DatabaseClosedError" => IdxError::DatabaseClosed,
            _ => IdxError::Unknown { name, message },
        }
    }
}

impl From<EngineError> for IdxError {
    fn from(err: EngineError) -> Self {
        IdxError::from_engine(err)
    }
}

impl From<serde_json::Error> for IdxError {
    fn from(err: serde_json::Error) -> Self {
        IdxError::DataClone(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_constraint() {
        let err = IdxError::Constraint("email already exists".to_string());
        assert_eq!(
            err.to_string(),
            "constraint violation: email already exists"
        );
    }

    #[test]
    fn error_display_invalid_table() {
        let err = IdxError::InvalidTable("users".to_string());
        assert_eq!(err.to_string(), "table 'users' not found");
    }

    #[test]
    fn error_display_database_closed() {
        let err = IdxError::DatabaseClosed;
        assert_eq!(err.to_string(), "database is closed");
    }

    #[test]
    fn engine_mapping_constraint() {
        let err = IdxError::from_engine(EngineError::new("ConstraintError", "dup key"));
        assert!(matches!(err, IdxError::Constraint(_)));
    }

    #[test]
    fn engine_mapping_version() {
        let err = IdxError::from_engine(EngineError::new("VersionError", "stored 3 > requested 2"));
        assert!(matches!(err, IdxError::VersionChange(_)));
    }

    #[test]
    fn engine_mapping_unknown_preserves_original() {
        let err = IdxError::from_engine(EngineError::new("WeirdVendorError", "boom"));
        match err {
            IdxError::Unknown { name, message } => {
                assert_eq!(name, "WeirdVendorError");
                assert_eq!(message, "boom");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn idx_result_ok() {
        let result: IdxResult<i32> = Ok(42);
        assert_eq!(result.unwrap(), 42);
    }
}
