use chrono::Utc;
use std::sync::Arc;
use steward_storage::ContextAuditStore;
use steward_types::{ContextAuditEvent, ContextAuditRecord, TenantContext};
use tracing::warn;

/// Releases an active context if the owning future is dropped before it
/// reaches `clear_context` (panic unwind or cancellation).
pub(crate) struct ScopeGuard<S: ContextAuditStore + ?Sized + 'static> {
    store: Arc<S>,
    context: Option<TenantContext>,
    audited: bool,
}

impl<S: ContextAuditStore + ?Sized + 'static> ScopeGuard<S> {
    pub(crate) fn new(store: Arc<S>, context: TenantContext, audited: bool) -> Self {
        Self {
            store,
            context: Some(context),
            audited,
        }
    }

    /// Normal exit: the caller clears the context itself.
    pub(crate) fn disarm(&mut self) {
        self.context = None;
    }
}

impl<S: ContextAuditStore + ?Sized + 'static> Drop for ScopeGuard<S> {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        warn!(
            organization_id = %context.organization_id,
            actor_id = %context.actor.id,
            "tenant context released on abnormal exit"
        );
        if !self.audited {
            return;
        }
        let record = ContextAuditRecord::for_context(ContextAuditEvent::Released, &context, Utc::now());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.append_context_audit(record).await {
                        warn!(error = %e, "failed to record context release");
                    }
                });
            }
            Err(_) => warn!("no runtime available to record context release"),
        }
    }
}
