use crate::model::{BeginOutcome, CreateOutcome, QueryWindow, StatusChange};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use steward_types::{
    Actor, ActorId, AssociationId, Committee, CommitteeId, CommitteeVote, ContextAuditRecord,
    DispatchResult, ErrorBody, IdempotencyClaim, IdempotencyRecord, IdempotencyStatus,
    InvocationLogEntry, Notice, OrganizationId, RequestId, ReviewRequest, TenantScope,
};

/// Tenant directory used to validate a context before it is established.
///
/// Not tenant-scoped: it is consulted to build the scope in the first place.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn organization_exists(&self, organization: &OrganizationId) -> StorageResult<bool>;

    /// Whether `association` belongs to `organization`.
    async fn association_in_organization(
        &self,
        organization: &OrganizationId,
        association: &AssociationId,
    ) -> StorageResult<bool>;

    async fn is_member(&self, organization: &OrganizationId, actor: &ActorId) -> StorageResult<bool>;

    /// Resolve an authenticated principal.
    async fn principal(&self, actor: &ActorId) -> StorageResult<Option<Actor>>;
}

/// Append-only, hash-linked trail of context activations.
#[async_trait]
pub trait ContextAuditStore: Send + Sync {
    /// Append a record and return it with sequence and hashes assigned.
    async fn append_context_audit(
        &self,
        record: ContextAuditRecord,
    ) -> StorageResult<ContextAuditRecord>;

    /// Read records newest-first.
    async fn list_context_audit(&self, window: QueryWindow)
        -> StorageResult<Vec<ContextAuditRecord>>;
}

/// Deduplication ledger keyed by `(scope organization, key)`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically insert a PENDING record, or take over one that is expired,
    /// FAILED, or PENDING past its lease (same family only).
    async fn try_begin(
        &self,
        scope: &TenantScope,
        key: &str,
        claim: &IdempotencyClaim,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<BeginOutcome>;

    /// Resolve a PENDING record owned by `attempt` as COMPLETED.
    async fn complete(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Resolve a PENDING record owned by `attempt` as FAILED.
    async fn fail(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        error: ErrorBody,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn get_record(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> StorageResult<Option<IdempotencyRecord>>;

    /// Delete records past their retention window. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}

/// Write-ahead log of dispatched invocations.
#[async_trait]
pub trait InvocationLogStore: Send + Sync {
    /// Insert a PENDING entry, or re-arm an existing unresolved one.
    /// A COMPLETED entry is returned untouched.
    async fn log_invocation(
        &self,
        scope: &TenantScope,
        entry: InvocationLogEntry,
    ) -> StorageResult<InvocationLogEntry>;

    async fn resolve_invocation(
        &self,
        scope: &TenantScope,
        key: &str,
        status: IdempotencyStatus,
        result: DispatchResult,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn get_invocation(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> StorageResult<Option<InvocationLogEntry>>;

    /// PENDING entries last touched at or before `cutoff`, across tenants.
    async fn stale_invocations(&self, cutoff: DateTime<Utc>)
        -> StorageResult<Vec<InvocationLogEntry>>;
}

/// Review request records. Every call is filtered by the scope.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert unless a request with the same `(organization, creation_key)`
    /// already exists.
    async fn create_request(
        &self,
        scope: &TenantScope,
        request: ReviewRequest,
    ) -> StorageResult<CreateOutcome>;

    /// Returns `None` when absent or outside the scope.
    async fn get_request(
        &self,
        scope: &TenantScope,
        id: &RequestId,
    ) -> StorageResult<Option<ReviewRequest>>;

    async fn find_by_creation_key(
        &self,
        scope: &TenantScope,
        creation_key: &str,
    ) -> StorageResult<Option<ReviewRequest>>;

    /// Atomic compare-and-set on status, appending the history entry in the
    /// same write. Fails with `StaleStatus` when the status moved, or
    /// `Conflict` when the history already holds the transition's key.
    async fn transition_status(
        &self,
        scope: &TenantScope,
        id: &RequestId,
        change: StatusChange,
    ) -> StorageResult<ReviewRequest>;
}

/// Committee rosters and append-only votes.
#[async_trait]
pub trait CommitteeStore: Send + Sync {
    async fn put_committee(&self, scope: &TenantScope, committee: Committee) -> StorageResult<()>;

    async fn get_committee(
        &self,
        scope: &TenantScope,
        id: &CommitteeId,
    ) -> StorageResult<Option<Committee>>;

    /// Append a vote on a request visible in the scope.
    async fn append_vote(&self, scope: &TenantScope, vote: CommitteeVote) -> StorageResult<()>;

    /// Votes for one request and round, oldest first.
    async fn votes(
        &self,
        scope: &TenantScope,
        request_id: &RequestId,
        round: u32,
    ) -> StorageResult<Vec<CommitteeVote>>;
}

/// Outbox of notices for the external notification collaborator.
#[async_trait]
pub trait NoticeOutbox: Send + Sync {
    /// Enqueue unless `(organization, request, transition_key)` is already
    /// present. Returns whether a new notice was stored.
    async fn enqueue_notice(&self, scope: &TenantScope, notice: Notice) -> StorageResult<bool>;

    async fn pending_notices(&self, scope: &TenantScope) -> StorageResult<Vec<Notice>>;

    async fn mark_delivered(
        &self,
        scope: &TenantScope,
        notice_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Unified storage bundle used by the dispatcher.
pub trait StewardStorage:
    OrganizationDirectory
    + ContextAuditStore
    + IdempotencyStore
    + InvocationLogStore
    + RequestStore
    + CommitteeStore
    + NoticeOutbox
    + Send
    + Sync
{
}

impl<T> StewardStorage for T where
    T: OrganizationDirectory
        + ContextAuditStore
        + IdempotencyStore
        + InvocationLogStore
        + RequestStore
        + CommitteeStore
        + NoticeOutbox
        + Send
        + Sync
{
}
