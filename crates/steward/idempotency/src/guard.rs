use crate::IdempotencyConfig;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use steward_storage::{BeginOutcome, IdempotencyStore};
use steward_types::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyStatus, OrganizationId, StewardError,
    StewardResult, TenantScope,
};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type WaiterKey = (OrganizationId, String);

/// Runs each `(tenant, key)` operation at most once.
pub struct IdempotencyGuard<S: ?Sized> {
    store: Arc<S>,
    config: IdempotencyConfig,
    /// In-process wakeups for duplicates waiting on a PENDING owner
    waiters: DashMap<WaiterKey, Arc<Notify>>,
}

impl<S> IdempotencyGuard<S>
where
    S: IdempotencyStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            waiters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Execute `operation` at most once for `key` within the scope's tenant.
    ///
    /// The operation's value is stored as JSON and replayed to every later
    /// caller with the same key until the record expires.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &TenantScope,
        key: &str,
        claim: IdempotencyClaim,
        operation: F,
    ) -> StewardResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StewardResult<T>>,
    {
        if key.trim().is_empty() {
            return Err(StewardError::MissingIdempotencyKey);
        }
        let organization = scope.require()?.organization_id.clone();
        let deadline = Instant::now() + self.config.wait_timeout();
        let mut operation = Some(operation);
        // Attempt number of the owner this caller is waiting on
        let mut waiting_on: Option<u32> = None;
        let _release = WaiterRelease {
            waiters: &self.waiters,
            key: (organization.clone(), key.to_string()),
        };

        loop {
            // Register interest before reading storage so a resolution between
            // the read and the wait is never missed.
            let notify = self.waiter(&organization, key);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();

            if let Some(attempt) = waiting_on {
                if let Some(record) = self.store.get_record(scope, key).await? {
                    if record.attempts == attempt && !record.is_expired(now) {
                        match record.status {
                            IdempotencyStatus::Completed => return self.replay(&record, &claim),
                            IdempotencyStatus::Failed => return Err(replayed_failure(&record)),
                            IdempotencyStatus::Pending if !record.lease_expired(now) => {
                                self.wait(notified.as_mut(), deadline, key).await?;
                                continue;
                            }
                            IdempotencyStatus::Pending => {}
                        }
                    }
                }
            }

            let outcome = self
                .store
                .try_begin(
                    scope,
                    key,
                    &claim,
                    now,
                    now + self.config.lease(),
                    now + self.config.retention(),
                )
                .await?;

            match outcome {
                BeginOutcome::Acquired(record) => {
                    let operation = operation.take().ok_or_else(|| {
                        StewardError::Internal("idempotent operation already consumed".to_string())
                    })?;
                    debug!(
                        organization_id = %organization,
                        idempotency_key = key,
                        attempt = record.attempts,
                        "idempotency key acquired"
                    );
                    let result = self
                        .run_owned(scope, &organization, key, record.attempts, operation)
                        .await;
                    self.wake(&organization, key);
                    return result;
                }
                BeginOutcome::Existing(record) => {
                    if record.family != claim.family {
                        warn!(
                            organization_id = %organization,
                            idempotency_key = key,
                            stored_family = %record.family,
                            requested_family = %claim.family,
                            "idempotency key reused for a different operation"
                        );
                        return Err(StewardError::KeyReuse {
                            key: key.to_string(),
                            family: record.family,
                        });
                    }
                    match record.status {
                        IdempotencyStatus::Completed => return self.replay(&record, &claim),
                        IdempotencyStatus::Failed => return Err(replayed_failure(&record)),
                        IdempotencyStatus::Pending => {
                            debug!(
                                organization_id = %organization,
                                idempotency_key = key,
                                attempt = record.attempts,
                                "waiting on in-flight duplicate"
                            );
                            waiting_on = Some(record.attempts);
                            self.wait(notified.as_mut(), deadline, key).await?;
                        }
                    }
                }
            }
        }
    }

    /// Delete records past their retention window.
    pub async fn purge_expired(&self) -> StewardResult<u64> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "purged expired idempotency records");
        }
        Ok(removed)
    }

    async fn run_owned<T, F, Fut>(
        &self,
        scope: &TenantScope,
        organization: &OrganizationId,
        key: &str,
        attempt: u32,
        operation: F,
    ) -> StewardResult<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StewardResult<T>>,
    {
        let outcome = tokio::time::timeout(self.config.operation_timeout(), operation()).await;

        let result = match outcome {
            Ok(Ok(value)) => match serde_json::to_value(&value) {
                Ok(json) => match self.store.complete(scope, key, attempt, json, Utc::now()).await {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        warn!(
                            organization_id = %organization,
                            idempotency_key = key,
                            error = %e,
                            "failed to record completed outcome"
                        );
                        Err(StewardError::from(e))
                    }
                },
                Err(e) => Err(StewardError::Internal(format!(
                    "failed to encode operation result: {e}"
                ))),
            },
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(
                    organization_id = %organization,
                    idempotency_key = key,
                    timeout_ms = self.config.operation_timeout_ms,
                    "idempotent operation timed out"
                );
                Err(StewardError::Timeout(self.config.operation_timeout_ms))
            }
        };

        if let Err(err) = &result {
            if let Err(e) = self
                .store
                .fail(scope, key, attempt, err.to_body(), Utc::now())
                .await
            {
                warn!(
                    organization_id = %organization,
                    idempotency_key = key,
                    error = %e,
                    "failed to record failed outcome"
                );
            }
        }
        result
    }

    fn replay<T: DeserializeOwned>(
        &self,
        record: &IdempotencyRecord,
        claim: &IdempotencyClaim,
    ) -> StewardResult<T> {
        if record.fingerprint != claim.fingerprint {
            warn!(
                organization_id = %record.organization_id,
                idempotency_key = %record.key,
                "idempotency key replayed with a different payload; returning stored result"
            );
        }
        debug!(
            organization_id = %record.organization_id,
            idempotency_key = %record.key,
            "returning stored idempotent result"
        );
        let value = record.result.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| StewardError::Internal(format!("failed to decode stored result: {e}")))
    }

    async fn wait(
        &self,
        notified: Pin<&mut Notified<'_>>,
        deadline: Instant,
        key: &str,
    ) -> StewardResult<()> {
        let now = Instant::now();
        if now >= deadline {
            warn!(idempotency_key = key, "gave up waiting on in-flight duplicate");
            return Err(StewardError::InProgress(key.to_string()));
        }
        let nap = self.config.poll_interval().min(deadline - now);
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(nap) => {}
        }
        Ok(())
    }

    fn waiter(&self, organization: &OrganizationId, key: &str) -> Arc<Notify> {
        self.waiters
            .entry((organization.clone(), key.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, organization: &OrganizationId, key: &str) {
        if let Some((_, notify)) = self.waiters.remove(&(organization.clone(), key.to_string())) {
            notify.notify_waiters();
        }
    }
}

/// Drops a key's waiter entry on every exit from `execute` once no other
/// caller still holds it.
struct WaiterRelease<'a> {
    waiters: &'a DashMap<WaiterKey, Arc<Notify>>,
    key: WaiterKey,
}

impl Drop for WaiterRelease<'_> {
    fn drop(&mut self) {
        self.waiters
            .remove_if(&self.key, |_, notify| Arc::strong_count(notify) == 1);
    }
}

fn replayed_failure(record: &IdempotencyRecord) -> StewardError {
    match &record.error {
        Some(body) => StewardError::Replayed(body.clone()),
        None => StewardError::Internal(format!(
            "operation for idempotency key {} failed",
            record.key
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use steward_storage::InMemoryStewardStorage;
    use steward_types::{Actor, ActorId, ErrorKind, RequestStatus, TenantContext};

    fn scope() -> TenantScope {
        let org = OrganizationId::new("org-a");
        TenantScope::Active(TenantContext::new(
            org.clone(),
            Actor::member_of(ActorId::new("alice"), org),
        ))
    }

    fn claim(family: &str) -> IdempotencyClaim {
        IdempotencyClaim::new(family, "fp")
    }

    fn setup(config: IdempotencyConfig) -> (Arc<InMemoryStewardStorage>, Arc<IdempotencyGuard<InMemoryStewardStorage>>) {
        let storage = Arc::new(InMemoryStewardStorage::new());
        let guard = Arc::new(IdempotencyGuard::new(storage.clone(), config));
        (storage, guard)
    }

    fn fast_config() -> IdempotencyConfig {
        IdempotencyConfig {
            operation_timeout_ms: 1_000,
            wait_timeout_ms: 2_000,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_call_returns_stored_result() {
        let (_, guard) = setup(fast_config());
        let runs = AtomicU32::new(0);

        for _ in 0..3 {
            let value: u32 = guard
                .execute(&scope(), "k1", claim("test.op"), || async {
                    Ok(runs.fetch_add(1, Ordering::SeqCst) + 41)
                })
                .await
                .unwrap();
            assert_eq!(value, 41);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_run_once() {
        let (_, guard) = setup(fast_config());
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let guard = guard.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .execute(&scope(), "k-concurrent", claim("test.op"), || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, StewardError>(runs.fetch_add(1, Ordering::SeqCst))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_record_permits_retry() {
        let (storage, guard) = setup(fast_config());

        let first: StewardResult<u32> = guard
            .execute(&scope(), "k2", claim("test.op"), || async {
                Err(StewardError::Storage("transient".into()))
            })
            .await;
        assert!(first.is_err());
        let record = storage.get_record(&scope(), "k2").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);

        let second: u32 = guard
            .execute(&scope(), "k2", claim("test.op"), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(second, 7);
        let record = storage.get_record(&scope(), "k2").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_duplicate_sees_original_failure() {
        let (_, guard) = setup(fast_config());

        let owner = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute(&scope(), "k3", claim("test.op"), || async {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Err::<u32, _>(StewardError::AlreadyFinalized(RequestStatus::Approved))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let duplicate: StewardResult<u32> = guard
            .execute(&scope(), "k3", claim("test.op"), || async { Ok(1) })
            .await;

        let original = owner.await.unwrap().unwrap_err();
        let duplicate = duplicate.unwrap_err();
        assert_eq!(duplicate.kind(), ErrorKind::BadRequest);
        assert_eq!(duplicate.to_string(), original.to_string());
    }

    #[tokio::test]
    async fn test_family_mismatch_is_conflict() {
        let (_, guard) = setup(fast_config());
        let _: u32 = guard
            .execute(&scope(), "k4", claim("review.cast_vote"), || async { Ok(1) })
            .await
            .unwrap();

        let err = guard
            .execute(&scope(), "k4", claim("review.withdraw"), || async { Ok(2u32) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_budget_exhausted_is_retryable_conflict() {
        let config = IdempotencyConfig {
            wait_timeout_ms: 30,
            poll_interval_ms: 5,
            ..Default::default()
        };
        let (_, guard) = setup(config);

        let owner = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute(&scope(), "k5", claim("test.op"), || async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, StewardError>(1u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = guard
            .execute(&scope(), "k5", claim("test.op"), || async { Ok(2u32) })
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::InProgress(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());

        assert_eq!(owner.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_record_failed() {
        let config = IdempotencyConfig {
            operation_timeout_ms: 20,
            ..fast_config()
        };
        let (storage, guard) = setup(config);

        let err = guard
            .execute(&scope(), "k6", claim("test.op"), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(1u32)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_retryable());

        let record = storage.get_record(&scope(), "k6").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
    }

    #[tokio::test]
    async fn test_abandoned_pending_is_taken_over() {
        let (storage, guard) = setup(fast_config());
        let past = Utc::now() - chrono::Duration::minutes(5);
        storage
            .try_begin(
                &scope(),
                "k7",
                &claim("test.op"),
                past,
                past + chrono::Duration::seconds(1),
                past + chrono::Duration::hours(24),
            )
            .await
            .unwrap();

        let value: u32 = guard
            .execute(&scope(), "k7", claim("test.op"), || async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_expired_record_is_ignored_and_purged() {
        let config = IdempotencyConfig {
            retention_secs: 0,
            ..fast_config()
        };
        let (_, guard) = setup(config);
        let runs = AtomicU32::new(0);

        for _ in 0..2 {
            let _: u32 = guard
                .execute(&scope(), "k8", claim("test.op"), || async {
                    Ok(runs.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(guard.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiters_do_not_accumulate() {
        let (_, guard) = setup(fast_config());

        for i in 0..50 {
            let key = format!("k-{i}");
            for _ in 0..2 {
                let _: u32 = guard
                    .execute(&scope(), &key, claim("test.op"), || async { Ok(1) })
                    .await
                    .unwrap();
            }
        }
        let _ = guard
            .execute(&scope(), "k-0", claim("other.op"), || async { Ok(2u32) })
            .await
            .unwrap_err();
        for _ in 0..2 {
            let _ = guard
                .execute(&scope(), "k-fail", claim("test.op"), || async {
                    Err::<u32, _>(StewardError::AlreadyFinalized(RequestStatus::Denied))
                })
                .await
                .unwrap_err();
        }

        assert!(guard.waiters.is_empty(), "{} waiter entries left", guard.waiters.len());
    }

    #[tokio::test]
    async fn test_unrecorded_completion_is_an_error() {
        let (storage, guard) = setup(fast_config());

        let result: StewardResult<u32> = guard
            .execute(&scope(), "k-fenced", claim("test.op"), || async {
                // Another owner takes the key over after this one's lease lapsed
                let later = Utc::now() + chrono::Duration::minutes(10);
                storage
                    .try_begin(
                        &scope(),
                        "k-fenced",
                        &claim("test.op"),
                        later,
                        later + chrono::Duration::seconds(30),
                        later + chrono::Duration::hours(24),
                    )
                    .await
                    .unwrap();
                Ok(1)
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_retryable());
        let record = storage.get_record(&scope(), "k-fenced").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.status, IdempotencyStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejects_blank_key_and_empty_scope() {
        let (_, guard) = setup(fast_config());
        let err = guard
            .execute(&scope(), "  ", claim("test.op"), || async { Ok(1u32) })
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::MissingIdempotencyKey));

        let err = guard
            .execute(&TenantScope::None, "k9", claim("test.op"), || async { Ok(1u32) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
