//! Invocation log entries, written before any side effect

use crate::{ActionKind, DispatchResult, IdempotencyStatus, OrganizationId, WorkflowInvocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationLogEntry {
    pub organization_id: OrganizationId,
    pub idempotency_key: String,
    pub action: ActionKind,
    pub payload_hash: String,
    /// The full invocation, replayed verbatim on recovery
    pub invocation: WorkflowInvocation,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DispatchResult>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvocationLogEntry {
    pub fn pending(invocation: WorkflowInvocation, payload_hash: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: invocation.organization_id.clone(),
            idempotency_key: invocation.idempotency_key.clone(),
            action: invocation.kind(),
            payload_hash: payload_hash.into(),
            invocation,
            status: IdempotencyStatus::Pending,
            result: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Still PENDING and last touched before `cutoff`
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Pending && self.updated_at <= cutoff
    }
}
