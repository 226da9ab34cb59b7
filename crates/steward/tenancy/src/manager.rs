use crate::guard::ScopeGuard;
use crate::TenancyConfig;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use steward_storage::{ContextAuditStore, OrganizationDirectory};
use steward_types::{
    ContextAuditEvent, ContextAuditRecord, StewardError, StewardResult, TenantContext, TenantScope,
};
use tracing::{debug, info, warn};

/// Establishes and clears tenant scopes against a directory and audit store.
pub struct TenantContextManager<S: ?Sized> {
    store: Arc<S>,
    config: TenancyConfig,
}

impl<S> TenantContextManager<S>
where
    S: OrganizationDirectory + ContextAuditStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, TenancyConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: TenancyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// Validate `ctx` and make it the active scope in `slot`.
    ///
    /// On any failure the slot is left empty and no ACTIVATED record exists.
    pub async fn set_context(&self, slot: &mut TenantScope, ctx: TenantContext) -> StewardResult<()> {
        if slot.is_active() {
            *slot = TenantScope::None;
            return Err(StewardError::Internal(
                "a tenant context is already active for this unit of work".to_string(),
            ));
        }

        if let Err(e) = self.validate(&ctx).await {
            *slot = TenantScope::None;
            warn!(
                organization_id = %ctx.organization_id,
                actor_id = %ctx.actor.id,
                error = %e,
                "tenant context rejected"
            );
            return Err(e);
        }

        if self.should_audit(&ctx) {
            if let Err(e) = self.audit(ContextAuditEvent::Activated, &ctx).await {
                *slot = TenantScope::None;
                return Err(e);
            }
        }

        debug!(
            organization_id = %ctx.organization_id,
            association_id = ?ctx.association_id,
            actor_id = %ctx.actor.id,
            privileged_override = ctx.privileged_override,
            "tenant context set"
        );
        *slot = TenantScope::Active(ctx);
        Ok(())
    }

    /// Reset `slot` to the fail-closed empty scope.
    ///
    /// The slot is cleared before the RELEASED record is written, so a failed
    /// audit write never leaves the scope active.
    pub async fn clear_context(&self, slot: &mut TenantScope) -> StewardResult<()> {
        let previous = std::mem::take(slot);
        let TenantScope::Active(ctx) = previous else {
            return Ok(());
        };
        debug!(
            organization_id = %ctx.organization_id,
            actor_id = %ctx.actor.id,
            "tenant context cleared"
        );
        if self.should_audit(&ctx) {
            self.audit(ContextAuditEvent::Released, &ctx).await?;
        }
        Ok(())
    }

    /// Run `f` inside the scope described by `ctx`.
    ///
    /// `f` only runs once the scope is established. The scope is released on
    /// every exit path, including panics and cancellation of the returned
    /// future.
    pub async fn with_context<F, Fut, T>(&self, ctx: TenantContext, f: F) -> StewardResult<T>
    where
        F: FnOnce(TenantScope) -> Fut,
        Fut: Future<Output = StewardResult<T>>,
    {
        let mut slot = TenantScope::None;
        self.set_context(&mut slot, ctx).await?;

        let active = slot.require()?.clone();
        let audited = self.should_audit(&active);
        let mut guard = ScopeGuard::new(self.store.clone(), active, audited);

        let result = f(slot.clone()).await;

        guard.disarm();
        if let Err(e) = self.clear_context(&mut slot).await {
            warn!(error = %e, "failed to record context release");
        }
        result
    }

    fn should_audit(&self, ctx: &TenantContext) -> bool {
        self.config.audit_all_activations || ctx.requires_audit()
    }

    async fn validate(&self, ctx: &TenantContext) -> StewardResult<()> {
        if !self.store.organization_exists(&ctx.organization_id).await? {
            return Err(StewardError::OrganizationNotFound(ctx.organization_id.clone()));
        }

        if let Some(association) = &ctx.association_id {
            if !self
                .store
                .association_in_organization(&ctx.organization_id, association)
                .await?
            {
                return Err(StewardError::AssociationNotFound {
                    organization: ctx.organization_id.clone(),
                    association: association.clone(),
                });
            }
        }

        if ctx.privileged_override && !ctx.actor.privileged {
            return Err(StewardError::OverrideNotPermitted(ctx.actor.id.clone()));
        }

        let reason_required = ctx.privileged_override
            || ctx.audit_reason.is_some()
            || (ctx.actor.privileged
                && ctx.is_cross_tenant()
                && self.config.require_cross_tenant_reason);
        if reason_required && !ctx.has_audit_reason() {
            return Err(StewardError::AuditReasonRequired);
        }

        if !ctx.actor.privileged
            && !self
                .store
                .is_member(&ctx.organization_id, &ctx.actor.id)
                .await?
        {
            return Err(StewardError::NotAMember {
                actor: ctx.actor.id.clone(),
                organization: ctx.organization_id.clone(),
            });
        }

        Ok(())
    }

    async fn audit(&self, event: ContextAuditEvent, ctx: &TenantContext) -> StewardResult<()> {
        let record = self
            .store
            .append_context_audit(ContextAuditRecord::for_context(event, ctx, Utc::now()))
            .await?;
        info!(
            organization_id = %ctx.organization_id,
            actor_id = %ctx.actor.id,
            event = event.as_str(),
            cross_tenant = record.cross_tenant,
            sequence = record.sequence,
            "tenant context audited"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use steward_storage::{InMemoryStewardStorage, QueryWindow};
    use steward_types::{Actor, ActorId, AssociationId, ErrorKind, OrganizationId};

    fn org_a() -> OrganizationId {
        OrganizationId::new("org-a")
    }

    fn alice() -> Actor {
        Actor::member_of(ActorId::new("alice"), org_a())
    }

    fn staff() -> Actor {
        Actor::member_of(ActorId::new("ops"), OrganizationId::new("org-ops")).privileged()
    }

    fn setup() -> (Arc<InMemoryStewardStorage>, TenantContextManager<InMemoryStewardStorage>) {
        let storage = Arc::new(InMemoryStewardStorage::new());
        storage.register_organization(org_a()).unwrap();
        storage
            .register_association(&org_a(), AssociationId::new("hoa-1"))
            .unwrap();
        storage.add_member(&org_a(), alice()).unwrap();
        storage.register_principal(staff()).unwrap();
        let manager = TenantContextManager::new(storage.clone());
        (storage, manager)
    }

    async fn audit_len(storage: &InMemoryStewardStorage) -> usize {
        storage
            .list_context_audit(QueryWindow::default())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_set_and_clear() {
        let (storage, manager) = setup();
        let mut slot = TenantScope::None;

        manager
            .set_context(&mut slot, TenantContext::new(org_a(), alice()))
            .await
            .unwrap();
        assert!(slot.is_active());

        manager.clear_context(&mut slot).await.unwrap();
        assert_eq!(slot, TenantScope::None);
        // Ordinary member access is not audited.
        assert_eq!(audit_len(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_not_found() {
        let (storage, manager) = setup();
        let mut slot = TenantScope::None;
        let err = manager
            .set_context(
                &mut slot,
                TenantContext::new(OrganizationId::new("nope"), alice()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!slot.is_active());
        assert_eq!(audit_len(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_foreign_association_is_not_found() {
        let (_, manager) = setup();
        let mut slot = TenantScope::None;
        let ctx = TenantContext::new(org_a(), alice()).with_association(AssociationId::new("hoa-9"));
        let err = manager.set_context(&mut slot, ctx).await.unwrap_err();
        assert!(matches!(err, StewardError::AssociationNotFound { .. }));
    }

    #[tokio::test]
    async fn test_non_member_is_forbidden() {
        let (_, manager) = setup();
        let mut slot = TenantScope::None;
        let mallory = Actor::member_of(ActorId::new("mallory"), OrganizationId::new("org-b"));
        let err = manager
            .set_context(&mut slot, TenantContext::new(org_a(), mallory))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_override_rules() {
        let (_, manager) = setup();
        let mut slot = TenantScope::None;

        let err = manager
            .set_context(
                &mut slot,
                TenantContext::new(org_a(), alice()).with_override("curious"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = manager
            .set_context(&mut slot, TenantContext::new(org_a(), staff()).with_override(" "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_cross_tenant_staff_requires_reason_and_is_audited() {
        let (storage, manager) = setup();
        let mut slot = TenantScope::None;

        let err = manager
            .set_context(&mut slot, TenantContext::new(org_a(), staff()))
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::AuditReasonRequired));

        let ctx = TenantContext::new(org_a(), staff())
            .with_audit_reason("ticket 4711")
            .with_target("review_request", "r-1");
        manager.set_context(&mut slot, ctx).await.unwrap();
        manager.clear_context(&mut slot).await.unwrap();

        let records = storage.list_context_audit(QueryWindow::default()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, ContextAuditEvent::Released);
        assert_eq!(records[1].event, ContextAuditEvent::Activated);
        assert!(records[1].cross_tenant);
        assert_eq!(records[1].reason.as_deref(), Some("ticket 4711"));
        assert_eq!(records[1].target_item_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_with_context_skips_body_when_set_fails() {
        let (_, manager) = setup();
        let ran = AtomicBool::new(false);
        let result: StewardResult<()> = manager
            .with_context(
                TenantContext::new(OrganizationId::new("nope"), alice()),
                |_| async {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_with_context_clears_on_error() {
        let (storage, manager) = setup();
        let ctx = TenantContext::new(org_a(), staff()).with_audit_reason("ticket 1");
        let result: StewardResult<()> = manager
            .with_context(ctx, |scope| async move {
                assert!(scope.is_active());
                Err(StewardError::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(audit_len(&storage).await, 2);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_with_context_releases_on_panic() {
        let (storage, manager) = setup();
        let manager = Arc::new(manager);
        let task_manager = manager.clone();

        let handle = tokio::spawn(async move {
            let ctx = TenantContext::new(org_a(), staff()).with_audit_reason("ticket 2");
            let _: StewardResult<()> = task_manager
                .with_context(ctx, |_| async {
                    panic!("operation blew up");
                    Ok::<(), StewardError>(())
                })
                .await;
        });
        assert!(handle.await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = storage.list_context_audit(QueryWindow::default()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, ContextAuditEvent::Released);
    }

    #[tokio::test]
    async fn test_with_context_releases_on_cancellation() {
        let (storage, manager) = setup();
        let ctx = TenantContext::new(org_a(), staff()).with_audit_reason("ticket 3");

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            manager.with_context(ctx, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, StewardError>(())
            }),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = storage.list_context_audit(QueryWindow::default()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, ContextAuditEvent::Released);
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let (storage, manager) = setup();
        let org_b = OrganizationId::new("org-b");
        storage.register_organization(org_b.clone()).unwrap();
        let bob = Actor::member_of(ActorId::new("bob"), org_b.clone());
        storage.add_member(&org_b, bob.clone()).unwrap();

        let a = manager.with_context(TenantContext::new(org_a(), alice()), |scope| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(scope.organization_id().cloned())
        });
        let b = manager.with_context(TenantContext::new(org_b.clone(), bob), |scope| async move {
            Ok(scope.organization_id().cloned())
        });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), Some(org_a()));
        assert_eq!(b.unwrap(), Some(org_b));
    }
}
