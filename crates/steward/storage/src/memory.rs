//! In-memory reference implementation of the Steward storage traits.
//!
//! This adapter is deterministic and test-friendly. Every compound operation
//! (insert-or-acquire, compare-and-set) runs under a single write lock, which
//! gives it the same atomicity the PostgreSQL adapter gets from conditional
//! statements. Production deployments should use a transactional backend.

use crate::model::{BeginOutcome, CreateOutcome, QueryWindow, StatusChange};
use crate::traits::{
    CommitteeStore, ContextAuditStore, IdempotencyStore, InvocationLogStore, NoticeOutbox,
    OrganizationDirectory, RequestStore,
};
use crate::{compute_context_audit_hash, scope_organization, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use steward_types::{
    Actor, ActorId, AssociationId, Committee, CommitteeId, CommitteeVote, ContextAuditRecord,
    DispatchResult, ErrorBody, IdempotencyClaim, IdempotencyRecord, IdempotencyStatus,
    InvocationLogEntry, Notice, OrganizationId, RequestId, ReviewRequest, TenantScope,
};

#[derive(Default)]
struct Tenant {
    associations: HashSet<AssociationId>,
    members: HashSet<ActorId>,
}

#[derive(Default)]
struct RequestTable {
    by_id: HashMap<RequestId, ReviewRequest>,
    by_creation_key: HashMap<(OrganizationId, String), RequestId>,
}

type LedgerKey = (OrganizationId, String);

/// In-memory Steward storage adapter.
#[derive(Default)]
pub struct InMemoryStewardStorage {
    tenants: RwLock<HashMap<OrganizationId, Tenant>>,
    principals: RwLock<HashMap<ActorId, Actor>>,
    context_audit: RwLock<Vec<ContextAuditRecord>>,
    idempotency: RwLock<HashMap<LedgerKey, IdempotencyRecord>>,
    invocations: RwLock<HashMap<LedgerKey, InvocationLogEntry>>,
    requests: RwLock<RequestTable>,
    committees: RwLock<HashMap<(OrganizationId, CommitteeId), Committee>>,
    votes: RwLock<Vec<CommitteeVote>>,
    notices: RwLock<Vec<Notice>>,
}

fn poisoned(name: &str) -> StorageError {
    StorageError::Backend(format!("{name} lock poisoned"))
}

impl InMemoryStewardStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Directory administration ────────────────────────────────────

    pub fn register_organization(&self, organization: OrganizationId) -> StorageResult<()> {
        let mut guard = self.tenants.write().map_err(|_| poisoned("tenants"))?;
        guard.entry(organization).or_default();
        Ok(())
    }

    pub fn register_association(
        &self,
        organization: &OrganizationId,
        association: AssociationId,
    ) -> StorageResult<()> {
        let mut guard = self.tenants.write().map_err(|_| poisoned("tenants"))?;
        let tenant = guard.get_mut(organization).ok_or_else(|| {
            StorageError::NotFound(format!("organization {organization} not found"))
        })?;
        tenant.associations.insert(association);
        Ok(())
    }

    /// Register a principal without any membership (e.g. operations staff).
    pub fn register_principal(&self, actor: Actor) -> StorageResult<()> {
        let mut guard = self.principals.write().map_err(|_| poisoned("principals"))?;
        guard.insert(actor.id.clone(), actor);
        Ok(())
    }

    /// Add `actor` as a member of `organization` and register the principal.
    pub fn add_member(&self, organization: &OrganizationId, actor: Actor) -> StorageResult<()> {
        {
            let mut guard = self.tenants.write().map_err(|_| poisoned("tenants"))?;
            let tenant = guard.get_mut(organization).ok_or_else(|| {
                StorageError::NotFound(format!("organization {organization} not found"))
            })?;
            tenant.members.insert(actor.id.clone());
        }
        self.register_principal(actor)
    }
}

#[async_trait]
impl OrganizationDirectory for InMemoryStewardStorage {
    async fn organization_exists(&self, organization: &OrganizationId) -> StorageResult<bool> {
        let guard = self.tenants.read().map_err(|_| poisoned("tenants"))?;
        Ok(guard.contains_key(organization))
    }

    async fn association_in_organization(
        &self,
        organization: &OrganizationId,
        association: &AssociationId,
    ) -> StorageResult<bool> {
        let guard = self.tenants.read().map_err(|_| poisoned("tenants"))?;
        Ok(guard
            .get(organization)
            .map(|t| t.associations.contains(association))
            .unwrap_or(false))
    }

    async fn is_member(&self, organization: &OrganizationId, actor: &ActorId) -> StorageResult<bool> {
        let guard = self.tenants.read().map_err(|_| poisoned("tenants"))?;
        Ok(guard
            .get(organization)
            .map(|t| t.members.contains(actor))
            .unwrap_or(false))
    }

    async fn principal(&self, actor: &ActorId) -> StorageResult<Option<Actor>> {
        let guard = self.principals.read().map_err(|_| poisoned("principals"))?;
        Ok(guard.get(actor).cloned())
    }
}

#[async_trait]
impl ContextAuditStore for InMemoryStewardStorage {
    async fn append_context_audit(
        &self,
        mut record: ContextAuditRecord,
    ) -> StorageResult<ContextAuditRecord> {
        let mut guard = self
            .context_audit
            .write()
            .map_err(|_| poisoned("context audit"))?;

        let previous_hash = guard.last().map(|r| r.hash.clone()).unwrap_or_default();
        let sequence = guard.len() as u64 + 1;
        record.hash = compute_context_audit_hash(&record, &previous_hash, sequence)?;
        record.sequence = sequence;
        record.previous_hash = previous_hash;

        guard.push(record.clone());
        Ok(record)
    }

    async fn list_context_audit(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<ContextAuditRecord>> {
        let guard = self
            .context_audit
            .read()
            .map_err(|_| poisoned("context audit"))?;
        let mut values = guard.clone();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStewardStorage {
    async fn try_begin(
        &self,
        scope: &TenantScope,
        key: &str,
        claim: &IdempotencyClaim,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<BeginOutcome> {
        let organization = scope_organization(scope)?.clone();
        let mut guard = self.idempotency.write().map_err(|_| poisoned("idempotency"))?;
        let ledger_key = (organization.clone(), key.to_string());

        let fresh = || {
            IdempotencyRecord::pending(
                organization.clone(),
                key,
                claim,
                now,
                lease_expires_at,
                expires_at,
            )
        };

        match guard.get_mut(&ledger_key) {
            None => {
                let record = fresh();
                guard.insert(ledger_key, record.clone());
                Ok(BeginOutcome::Acquired(record))
            }
            Some(existing) if existing.is_expired(now) => {
                *existing = fresh();
                Ok(BeginOutcome::Acquired(existing.clone()))
            }
            Some(existing) if existing.family == claim.family && existing.is_reclaimable(now) => {
                existing.status = IdempotencyStatus::Pending;
                existing.fingerprint = claim.fingerprint.clone();
                existing.result = None;
                existing.error = None;
                existing.attempts += 1;
                existing.updated_at = now;
                existing.lease_expires_at = lease_expires_at;
                existing.expires_at = expires_at;
                Ok(BeginOutcome::Acquired(existing.clone()))
            }
            Some(existing) => Ok(BeginOutcome::Existing(existing.clone())),
        }
    }

    async fn complete(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?.clone();
        let mut guard = self.idempotency.write().map_err(|_| poisoned("idempotency"))?;
        let record = owned_pending(&mut guard, (organization, key.to_string()), attempt)?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.updated_at = now;
        Ok(())
    }

    async fn fail(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        error: ErrorBody,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?.clone();
        let mut guard = self.idempotency.write().map_err(|_| poisoned("idempotency"))?;
        let record = owned_pending(&mut guard, (organization, key.to_string()), attempt)?;
        record.status = IdempotencyStatus::Failed;
        record.error = Some(error);
        record.updated_at = now;
        Ok(())
    }

    async fn get_record(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> StorageResult<Option<IdempotencyRecord>> {
        let Some(organization) = scope.organization_id() else {
            return Ok(None);
        };
        let guard = self.idempotency.read().map_err(|_| poisoned("idempotency"))?;
        Ok(guard.get(&(organization.clone(), key.to_string())).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut guard = self.idempotency.write().map_err(|_| poisoned("idempotency"))?;
        let before = guard.len();
        guard.retain(|_, record| !record.is_expired(now));
        Ok((before - guard.len()) as u64)
    }
}

/// The PENDING record at `key`, provided `attempt` still owns it.
fn owned_pending(
    ledger: &mut HashMap<LedgerKey, IdempotencyRecord>,
    key: LedgerKey,
    attempt: u32,
) -> StorageResult<&mut IdempotencyRecord> {
    let record = ledger
        .get_mut(&key)
        .ok_or_else(|| StorageError::NotFound(format!("idempotency key {} not found", key.1)))?;
    if record.status != IdempotencyStatus::Pending || record.attempts != attempt {
        return Err(StorageError::Conflict(format!(
            "idempotency key {} is no longer owned by attempt {attempt}",
            key.1
        )));
    }
    Ok(record)
}

#[async_trait]
impl InvocationLogStore for InMemoryStewardStorage {
    async fn log_invocation(
        &self,
        scope: &TenantScope,
        entry: InvocationLogEntry,
    ) -> StorageResult<InvocationLogEntry> {
        let organization = scope_organization(scope)?;
        if organization != &entry.organization_id {
            return Err(StorageError::Denied(format!(
                "invocation for {} outside scope {organization}",
                entry.organization_id
            )));
        }
        let mut guard = self.invocations.write().map_err(|_| poisoned("invocations"))?;
        let key = (entry.organization_id.clone(), entry.idempotency_key.clone());
        match guard.get_mut(&key) {
            None => {
                guard.insert(key, entry.clone());
                Ok(entry)
            }
            Some(existing) if existing.status == IdempotencyStatus::Completed => {
                Ok(existing.clone())
            }
            Some(existing) => {
                existing.action = entry.action;
                existing.payload_hash = entry.payload_hash;
                existing.invocation = entry.invocation;
                existing.status = IdempotencyStatus::Pending;
                existing.result = None;
                existing.attempts += 1;
                existing.updated_at = entry.updated_at;
                Ok(existing.clone())
            }
        }
    }

    async fn resolve_invocation(
        &self,
        scope: &TenantScope,
        key: &str,
        status: IdempotencyStatus,
        result: DispatchResult,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?.clone();
        let mut guard = self.invocations.write().map_err(|_| poisoned("invocations"))?;
        let entry = guard
            .get_mut(&(organization, key.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("invocation {key} not found")))?;
        entry.status = status;
        entry.result = Some(result);
        entry.updated_at = now;
        Ok(())
    }

    async fn get_invocation(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> StorageResult<Option<InvocationLogEntry>> {
        let Some(organization) = scope.organization_id() else {
            return Ok(None);
        };
        let guard = self.invocations.read().map_err(|_| poisoned("invocations"))?;
        Ok(guard.get(&(organization.clone(), key.to_string())).cloned())
    }

    async fn stale_invocations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<InvocationLogEntry>> {
        let guard = self.invocations.read().map_err(|_| poisoned("invocations"))?;
        let mut values = guard
            .values()
            .filter(|e| e.is_stale(cutoff))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

#[async_trait]
impl RequestStore for InMemoryStewardStorage {
    async fn create_request(
        &self,
        scope: &TenantScope,
        request: ReviewRequest,
    ) -> StorageResult<CreateOutcome> {
        if !scope.permits(&request.organization_id, request.association_id.as_ref()) {
            return Err(StorageError::Denied(format!(
                "request {} outside scope",
                request.id
            )));
        }
        let mut guard = self.requests.write().map_err(|_| poisoned("requests"))?;
        let creation = (request.organization_id.clone(), request.creation_key.clone());
        if let Some(existing) = guard
            .by_creation_key
            .get(&creation)
            .and_then(|id| guard.by_id.get(id))
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        if guard.by_id.contains_key(&request.id) {
            return Err(StorageError::Conflict(format!(
                "request {} already exists",
                request.id
            )));
        }
        guard.by_creation_key.insert(creation, request.id.clone());
        guard.by_id.insert(request.id.clone(), request.clone());
        Ok(CreateOutcome::Created(request))
    }

    async fn get_request(
        &self,
        scope: &TenantScope,
        id: &RequestId,
    ) -> StorageResult<Option<ReviewRequest>> {
        let guard = self.requests.read().map_err(|_| poisoned("requests"))?;
        Ok(guard
            .by_id
            .get(id)
            .filter(|r| scope.permits(&r.organization_id, r.association_id.as_ref()))
            .cloned())
    }

    async fn find_by_creation_key(
        &self,
        scope: &TenantScope,
        creation_key: &str,
    ) -> StorageResult<Option<ReviewRequest>> {
        let Some(organization) = scope.organization_id() else {
            return Ok(None);
        };
        let guard = self.requests.read().map_err(|_| poisoned("requests"))?;
        Ok(guard
            .by_creation_key
            .get(&(organization.clone(), creation_key.to_string()))
            .and_then(|id| guard.by_id.get(id))
            .filter(|r| scope.permits(&r.organization_id, r.association_id.as_ref()))
            .cloned())
    }

    async fn transition_status(
        &self,
        scope: &TenantScope,
        id: &RequestId,
        change: StatusChange,
    ) -> StorageResult<ReviewRequest> {
        let mut guard = self.requests.write().map_err(|_| poisoned("requests"))?;
        let record = match guard.by_id.get_mut(id) {
            Some(r) if scope.permits(&r.organization_id, r.association_id.as_ref()) => r,
            _ => return Err(StorageError::NotFound(format!("request {id} not found"))),
        };

        if record.applied_by(&change.transition.idempotency_key).is_some() {
            return Err(StorageError::Conflict(format!(
                "transition {} already applied to request {id}",
                change.transition.idempotency_key
            )));
        }
        if record.status != change.expected {
            return Err(StorageError::StaleStatus {
                expected: change.expected,
                actual: record.status,
            });
        }

        if let Some(vote) = change.vote {
            self.votes.write().map_err(|_| poisoned("votes"))?.push(vote);
        }
        record.status = change.transition.to;
        if change.bump_round {
            record.round += 1;
        }
        record.updated_at = change.transition.at;
        record.history.push(change.transition);
        Ok(record.clone())
    }
}

#[async_trait]
impl CommitteeStore for InMemoryStewardStorage {
    async fn put_committee(&self, scope: &TenantScope, committee: Committee) -> StorageResult<()> {
        if !scope.permits(&committee.organization_id, committee.association_id.as_ref()) {
            return Err(StorageError::Denied(format!(
                "committee {} outside scope",
                committee.committee_id
            )));
        }
        let mut guard = self.committees.write().map_err(|_| poisoned("committees"))?;
        let key = (committee.organization_id.clone(), committee.committee_id.clone());
        if let Some(existing) = guard.get(&key) {
            if !scope.permits(&existing.organization_id, existing.association_id.as_ref()) {
                return Err(StorageError::Denied(format!(
                    "committee {} outside scope",
                    committee.committee_id
                )));
            }
        }
        guard.insert(key, committee);
        Ok(())
    }

    async fn get_committee(
        &self,
        scope: &TenantScope,
        id: &CommitteeId,
    ) -> StorageResult<Option<Committee>> {
        let Some(organization) = scope.organization_id() else {
            return Ok(None);
        };
        let guard = self.committees.read().map_err(|_| poisoned("committees"))?;
        Ok(guard
            .get(&(organization.clone(), id.clone()))
            .filter(|c| scope.permits(&c.organization_id, c.association_id.as_ref()))
            .cloned())
    }

    async fn append_vote(&self, scope: &TenantScope, vote: CommitteeVote) -> StorageResult<()> {
        if self.get_request(scope, &vote.request_id).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "request {} not found",
                vote.request_id
            )));
        }
        let mut guard = self.votes.write().map_err(|_| poisoned("votes"))?;
        guard.push(vote);
        Ok(())
    }

    async fn votes(
        &self,
        scope: &TenantScope,
        request_id: &RequestId,
        round: u32,
    ) -> StorageResult<Vec<CommitteeVote>> {
        if self.get_request(scope, request_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let guard = self.votes.read().map_err(|_| poisoned("votes"))?;
        Ok(guard
            .iter()
            .filter(|v| &v.request_id == request_id && v.round == round)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NoticeOutbox for InMemoryStewardStorage {
    async fn enqueue_notice(&self, scope: &TenantScope, notice: Notice) -> StorageResult<bool> {
        if !scope.permits(&notice.organization_id, notice.association_id.as_ref()) {
            return Err(StorageError::Denied(format!(
                "notice for request {} outside scope",
                notice.request_id
            )));
        }
        let mut guard = self.notices.write().map_err(|_| poisoned("notices"))?;
        let key = notice.dedup_key();
        if guard.iter().any(|n| n.dedup_key() == key) {
            return Ok(false);
        }
        guard.push(notice);
        Ok(true)
    }

    async fn pending_notices(&self, scope: &TenantScope) -> StorageResult<Vec<Notice>> {
        let guard = self.notices.read().map_err(|_| poisoned("notices"))?;
        Ok(guard
            .iter()
            .filter(|n| n.delivered_at.is_none())
            .filter(|n| scope.permits(&n.organization_id, n.association_id.as_ref()))
            .cloned()
            .collect())
    }

    async fn mark_delivered(
        &self,
        scope: &TenantScope,
        notice_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self.notices.write().map_err(|_| poisoned("notices"))?;
        let notice = guard
            .iter_mut()
            .find(|n| {
                n.notice_id == notice_id
                    && scope.permits(&n.organization_id, n.association_id.as_ref())
            })
            .ok_or_else(|| StorageError::NotFound(format!("notice {notice_id} not found")))?;
        notice.delivered_at = Some(at);
        Ok(())
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
