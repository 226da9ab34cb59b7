use serde::{Deserialize, Serialize};
use steward_types::{
    CommitteeVote, IdempotencyRecord, RequestStatus, ReviewRequest, TransitionRecord,
};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Outcome of an atomic insert-or-acquire on the idempotency ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller owns the key and must run the operation.
    Acquired(IdempotencyRecord),
    /// Someone else holds (or already resolved) the key.
    Existing(IdempotencyRecord),
}

/// Outcome of an insert-if-absent on `(organization, creation_key)`.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ReviewRequest),
    Existing(ReviewRequest),
}

impl CreateOutcome {
    pub fn into_request(self) -> ReviewRequest {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }
}

/// A compare-and-set status change plus the history entry written with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub expected: RequestStatus,
    pub transition: TransitionRecord,
    /// Start a new review round (resubmission)
    #[serde(default)]
    pub bump_round: bool,
    /// Vote persisted together with the transition, or not at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<CommitteeVote>,
}
