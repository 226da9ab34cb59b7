//! Restart recovery from the invocation log

use crate::Dispatcher;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use steward_storage::StewardStorage;
use steward_types::{DispatchResult, StewardResult};
use tracing::{info, warn};

/// Outcome of one recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Stale entries found
    pub scanned: usize,
    /// Replays that ended in success
    pub completed: usize,
    /// Replays that ended in an error envelope
    pub failed: usize,
    /// `(idempotency key, result)` per replay
    pub results: Vec<(String, DispatchResult)>,
}

impl<S> Dispatcher<S>
where
    S: StewardStorage + ?Sized + 'static,
{
    /// Replay invocations left PENDING for longer than the idempotency lease.
    ///
    /// Each entry is dispatched again under its original key, so mutations
    /// that were already applied are detected and not repeated.
    pub async fn recover_pending(&self, now: DateTime<Utc>) -> StewardResult<RecoveryReport> {
        let cutoff = now - self.config().idempotency.lease();
        let stale = self.storage().stale_invocations(cutoff).await?;
        if stale.is_empty() {
            return Ok(RecoveryReport::default());
        }
        info!(count = stale.len(), cutoff = %cutoff, "replaying stale invocations");

        let concurrency = self.config().recovery.concurrency.max(1);
        let results: Vec<(String, DispatchResult)> = stream::iter(stale)
            .map(|entry| async move {
                let key = entry.idempotency_key.clone();
                let result = self.dispatch(entry.invocation).await;
                if !result.success {
                    warn!(
                        organization_id = %entry.organization_id,
                        idempotency_key = %key,
                        error = ?result.error,
                        "recovered invocation failed"
                    );
                }
                (key, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let completed = results.iter().filter(|(_, r)| r.success).count();
        let report = RecoveryReport {
            scanned: results.len(),
            completed,
            failed: results.len() - completed,
            results,
        };
        info!(
            scanned = report.scanned,
            completed = report.completed,
            failed = report.failed,
            "recovery sweep finished"
        );
        Ok(report)
    }
}
