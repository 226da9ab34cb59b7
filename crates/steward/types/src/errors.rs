//! Error taxonomy for the request-execution core

use crate::{ActorId, AssociationId, CommitteeId, OrganizationId, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};

/// Coarse error class surfaced to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Forbidden,
    Conflict,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Serializable snapshot of an error, stored on FAILED idempotency records
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Errors that can occur in Steward operations
#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    #[error("Organization not found: {0}")]
    OrganizationNotFound(OrganizationId),

    #[error("Association {association} not found in organization {organization}")]
    AssociationNotFound {
        organization: OrganizationId,
        association: AssociationId,
    },

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Committee not found: {0}")]
    CommitteeNotFound(CommitteeId),

    #[error("Actor {actor} is not a member of organization {organization}")]
    NotAMember {
        actor: ActorId,
        organization: OrganizationId,
    },

    #[error("Actor {actor} is not a member of committee {committee}")]
    NotACommitteeMember { actor: ActorId, committee: CommitteeId },

    #[error("Actor {0} is not permitted to use a privileged override")]
    OverrideNotPermitted(ActorId),

    #[error("No tenant context is active")]
    NoTenantContext,

    #[error("An audit reason is required for this access")]
    AuditReasonRequired,

    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    #[error("Entity id is required for action {0}")]
    MissingEntityId(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Action {action} is not allowed from status {status}")]
    IllegalTransition { action: String, status: RequestStatus },

    #[error("Request is in terminal status {0} and accepts no further actions")]
    TerminalRequest(RequestStatus),

    #[error("Request already finalized with status {0}")]
    AlreadyFinalized(RequestStatus),

    #[error("Request status changed concurrently: expected {expected}, found {actual}")]
    StaleStatus {
        expected: RequestStatus,
        actual: RequestStatus,
    },

    #[error("Quorum not met: required {required} votes, have {current}")]
    QuorumNotMet { required: u32, current: u32 },

    #[error("Approval threshold not met: required {required}%, have {actual:.1}%")]
    ThresholdNotMet { required: f64, actual: f64 },

    #[error("Idempotency key {key} was already used for a different operation ({family})")]
    KeyReuse { key: String, family: String },

    #[error("Operation for idempotency key {0} is still in progress")]
    InProgress(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A stored failure replayed to a duplicate caller
    #[error("{}", .0.message)]
    Replayed(ErrorBody),
}

impl StewardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StewardError::OrganizationNotFound(_)
            | StewardError::AssociationNotFound { .. }
            | StewardError::RequestNotFound(_)
            | StewardError::CommitteeNotFound(_) => ErrorKind::NotFound,

            StewardError::NotAMember { .. }
            | StewardError::NotACommitteeMember { .. }
            | StewardError::OverrideNotPermitted(_)
            | StewardError::NoTenantContext => ErrorKind::Forbidden,

            StewardError::AuditReasonRequired
            | StewardError::MissingIdempotencyKey
            | StewardError::MissingEntityId(_)
            | StewardError::InvalidPayload(_)
            | StewardError::UnknownAction(_)
            | StewardError::IllegalTransition { .. }
            | StewardError::TerminalRequest(_)
            | StewardError::AlreadyFinalized(_)
            | StewardError::StaleStatus { .. }
            | StewardError::QuorumNotMet { .. }
            | StewardError::ThresholdNotMet { .. } => ErrorKind::BadRequest,

            StewardError::KeyReuse { .. } | StewardError::InProgress(_) => ErrorKind::Conflict,

            StewardError::Timeout(_) | StewardError::Storage(_) | StewardError::Internal(_) => {
                ErrorKind::Internal
            }

            StewardError::Replayed(body) => body.kind,
        }
    }

    /// Whether the caller may safely retry with the same idempotency key
    pub fn is_retryable(&self) -> bool {
        match self {
            StewardError::InProgress(_) => true,
            StewardError::Replayed(body) => body.retryable,
            other => other.kind() == ErrorKind::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            StewardError::Replayed(body) => body.clone(),
            other => ErrorBody {
                kind: other.kind(),
                message: other.to_string(),
                retryable: other.is_retryable(),
            },
        }
    }
}

impl From<ErrorBody> for StewardError {
    fn from(body: ErrorBody) -> Self {
        StewardError::Replayed(body)
    }
}

/// Result type alias for steward operations
pub type StewardResult<T> = Result<T, StewardError>;
