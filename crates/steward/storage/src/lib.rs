//! Steward storage abstractions.
//!
//! This crate defines the persistence contract for the request-execution core:
//! - tenant directory (organizations, associations, membership)
//! - hash-linked context audit trail
//! - idempotency ledger with atomic insert-or-acquire
//! - invocation write-ahead log for restart recovery
//! - review requests with compare-and-set status transitions
//! - committee rosters and append-only votes
//! - notice outbox
//!
//! Every tenant-scoped call takes an explicit [`TenantScope`]. An empty scope
//! is fail-closed: reads return nothing and writes are denied.
//!
//! [`TenantScope`]: steward_types::TenantScope

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStewardStorage;
pub use model::{BeginOutcome, CreateOutcome, QueryWindow, StatusChange};
pub use traits::{
    CommitteeStore, ContextAuditStore, IdempotencyStore, InvocationLogStore, NoticeOutbox,
    OrganizationDirectory, RequestStore, StewardStorage,
};

use steward_types::{ContextAuditRecord, OrganizationId, TenantScope};

/// The organization a scope is bound to, or `Denied` for an empty scope.
pub(crate) fn scope_organization(scope: &TenantScope) -> StorageResult<&OrganizationId> {
    scope
        .organization_id()
        .ok_or_else(|| StorageError::Denied("no tenant context".to_string()))
}

pub(crate) fn compute_context_audit_hash(
    record: &ContextAuditRecord,
    previous_hash: &str,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "event": record.event,
        "organization_id": record.organization_id,
        "association_id": record.association_id,
        "actor_id": record.actor_id,
        "privileged": record.privileged,
        "cross_tenant": record.cross_tenant,
        "reason": record.reason,
        "target_item_type": record.target_item_type,
        "target_item_id": record.target_item_id,
        "timestamp": record.timestamp,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Recompute every link of a chain read oldest-first.
pub fn verify_context_audit_chain(records: &[ContextAuditRecord]) -> StorageResult<bool> {
    let mut previous = String::new();
    for record in records {
        if record.previous_hash != previous {
            return Ok(false);
        }
        if compute_context_audit_hash(record, &previous, record.sequence)? != record.hash {
            return Ok(false);
        }
        previous = record.hash.clone();
    }
    Ok(true)
}
