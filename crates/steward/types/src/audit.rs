//! Context audit trail: who entered which tenant, why, and when they left
//!
//! Records form a hash-linked chain per store. `sequence`, `previous_hash`
//! and `hash` are assigned by the store on append.

use crate::{ActorId, AssociationId, OrganizationId, TenantContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextAuditEvent {
    Activated,
    Released,
}

impl ContextAuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextAuditEvent::Activated => "ACTIVATED",
            ContextAuditEvent::Released => "RELEASED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextAuditRecord {
    pub event: ContextAuditEvent,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub actor_id: ActorId,
    pub privileged: bool,
    pub cross_tenant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_item_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub previous_hash: String,
    pub hash: String,
}

impl ContextAuditRecord {
    pub fn for_context(event: ContextAuditEvent, ctx: &TenantContext, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            organization_id: ctx.organization_id.clone(),
            association_id: ctx.association_id.clone(),
            actor_id: ctx.actor.id.clone(),
            privileged: ctx.actor.privileged,
            cross_tenant: ctx.is_cross_tenant(),
            reason: ctx.audit_reason.clone(),
            target_item_type: ctx.target_item_type.clone(),
            target_item_id: ctx.target_item_id.clone(),
            timestamp,
            sequence: 0,
            previous_hash: String::new(),
            hash: String::new(),
        }
    }
}
