use steward_types::{RequestStatus, StewardError};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The scope is absent or does not cover the record.
    #[error("access denied: {0}")]
    Denied(String),

    /// Compare-and-set precondition failed.
    #[error("status precondition failed: expected {expected}, found {actual}")]
    StaleStatus {
        expected: RequestStatus,
        actual: RequestStatus,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for StewardError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Denied(_) => StewardError::NoTenantContext,
            StorageError::StaleStatus { actual, .. } if actual.is_terminal() => {
                StewardError::AlreadyFinalized(actual)
            }
            StorageError::StaleStatus { expected, actual } => {
                StewardError::StaleStatus { expected, actual }
            }
            StorageError::InvalidInput(msg) => StewardError::InvalidPayload(msg),
            other => StewardError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_types::ErrorKind;

    #[test]
    fn stale_status_into_terminal_is_already_finalized() {
        let err: StewardError = StorageError::StaleStatus {
            expected: RequestStatus::UnderReview,
            actual: RequestStatus::Approved,
        }
        .into();
        assert!(matches!(err, StewardError::AlreadyFinalized(RequestStatus::Approved)));
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn denied_maps_to_forbidden() {
        let err: StewardError = StorageError::Denied("no scope".into()).into();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn backend_maps_to_retryable_internal() {
        let err: StewardError = StorageError::Backend("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_retryable());
    }
}
