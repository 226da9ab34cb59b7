//! Tenant context and the explicit scope value threaded through storage

use crate::{ActorId, AssociationId, OrganizationId, StewardError, StewardResult};
use serde::{Deserialize, Serialize};

/// A principal performing an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    /// The tenant this actor belongs to, if any (service principals may have none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_organization: Option<OrganizationId>,
    /// Support/operations staff allowed to enter other tenants with a reason
    #[serde(default)]
    pub privileged: bool,
}

impl Actor {
    pub fn new(id: ActorId) -> Self {
        Self {
            id,
            home_organization: None,
            privileged: false,
        }
    }

    pub fn member_of(id: ActorId, organization: OrganizationId) -> Self {
        Self {
            id,
            home_organization: Some(organization),
            privileged: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// The isolation boundary for one unit of work.
///
/// Never stored as a singleton; only its audit trail is persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub actor: Actor,
    /// Bypasses association filtering (never organization filtering)
    #[serde(default)]
    pub privileged_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_item_id: Option<String>,
}

impl TenantContext {
    pub fn new(organization_id: OrganizationId, actor: Actor) -> Self {
        Self {
            organization_id,
            association_id: None,
            actor,
            privileged_override: false,
            audit_reason: None,
            target_item_type: None,
            target_item_id: None,
        }
    }

    pub fn with_association(mut self, association_id: AssociationId) -> Self {
        self.association_id = Some(association_id);
        self
    }

    pub fn with_audit_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_reason = Some(reason.into());
        self
    }

    /// Request a privileged override; the reason is mandatory
    pub fn with_override(mut self, reason: impl Into<String>) -> Self {
        self.privileged_override = true;
        self.audit_reason = Some(reason.into());
        self
    }

    pub fn with_target(mut self, item_type: impl Into<String>, item_id: impl Into<String>) -> Self {
        self.target_item_type = Some(item_type.into());
        self.target_item_id = Some(item_id.into());
        self
    }

    /// True when the actor is operating outside its home organization
    pub fn is_cross_tenant(&self) -> bool {
        self.actor.home_organization.as_ref() != Some(&self.organization_id)
    }

    /// Whether activation must leave an audit record
    pub fn requires_audit(&self) -> bool {
        self.audit_reason.is_some() || self.privileged_override || (self.actor.privileged && self.is_cross_tenant())
    }

    pub fn has_audit_reason(&self) -> bool {
        self.audit_reason
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false)
    }
}

/// The explicit tenant scope passed to every tenant-scoped storage call.
///
/// `None` is fail-closed: scoped reads return nothing and scoped writes are
/// denied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TenantScope {
    #[default]
    None,
    Active(TenantContext),
}

impl TenantScope {
    pub fn is_active(&self) -> bool {
        matches!(self, TenantScope::Active(_))
    }

    pub fn context(&self) -> Option<&TenantContext> {
        match self {
            TenantScope::None => None,
            TenantScope::Active(ctx) => Some(ctx),
        }
    }

    /// The active context, or FORBIDDEN when no tenant is in scope
    pub fn require(&self) -> StewardResult<&TenantContext> {
        self.context().ok_or(StewardError::NoTenantContext)
    }

    pub fn organization_id(&self) -> Option<&OrganizationId> {
        self.context().map(|c| &c.organization_id)
    }

    /// Whether a record owned by `(organization, association)` is visible.
    ///
    /// A context without an association sees the whole organization. A context
    /// with an association sees only that association's records unless the
    /// privileged override is set.
    pub fn permits(&self, organization: &OrganizationId, association: Option<&AssociationId>) -> bool {
        let Some(ctx) = self.context() else {
            return false;
        };
        if &ctx.organization_id != organization {
            return false;
        }
        if ctx.privileged_override {
            return true;
        }
        match &ctx.association_id {
            None => true,
            Some(scoped) => association == Some(scoped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(s: &str) -> OrganizationId {
        OrganizationId::new(s)
    }

    fn ctx() -> TenantContext {
        TenantContext::new(org("org-a"), Actor::member_of(ActorId::new("alice"), org("org-a")))
    }

    #[test]
    fn test_empty_scope_denies_everything() {
        let scope = TenantScope::None;
        assert!(!scope.permits(&org("org-a"), None));
        assert!(matches!(scope.require(), Err(StewardError::NoTenantContext)));
    }

    #[test]
    fn test_organization_filter() {
        let scope = TenantScope::Active(ctx());
        assert!(scope.permits(&org("org-a"), None));
        assert!(scope.permits(&org("org-a"), Some(&AssociationId::new("hoa-1"))));
        assert!(!scope.permits(&org("org-b"), None));
    }

    #[test]
    fn test_association_filter_and_override() {
        let hoa1 = AssociationId::new("hoa-1");
        let hoa2 = AssociationId::new("hoa-2");

        let scoped = TenantScope::Active(ctx().with_association(hoa1.clone()));
        assert!(scoped.permits(&org("org-a"), Some(&hoa1)));
        assert!(!scoped.permits(&org("org-a"), Some(&hoa2)));
        assert!(!scoped.permits(&org("org-a"), None));

        let overridden = TenantScope::Active(ctx().with_association(hoa1).with_override("ticket 42"));
        assert!(overridden.permits(&org("org-a"), Some(&hoa2)));
        assert!(!overridden.permits(&org("org-b"), Some(&hoa2)));
    }

    #[test]
    fn test_cross_tenant_privileged_requires_audit() {
        let staff = Actor::member_of(ActorId::new("ops"), org("org-ops")).privileged();
        let c = TenantContext::new(org("org-a"), staff);
        assert!(c.is_cross_tenant());
        assert!(c.requires_audit());
        assert!(!ctx().requires_audit());
    }

    #[test]
    fn test_blank_reason_is_not_a_reason() {
        let c = ctx().with_audit_reason("   ");
        assert!(!c.has_audit_reason());
    }
}
