//! PostgreSQL adapter for Steward storage.
//!
//! This adapter is the transactional source-of-truth backend. Insert-or-acquire
//! on the idempotency ledger is a single `INSERT .. ON CONFLICT DO UPDATE ..
//! WHERE`, and status transitions are a conditional `UPDATE .. WHERE status =`
//! so a zero row count is the compare-and-set failure.

use crate::model::{BeginOutcome, CreateOutcome, QueryWindow, StatusChange};
use crate::traits::{
    CommitteeStore, ContextAuditStore, IdempotencyStore, InvocationLogStore, NoticeOutbox,
    OrganizationDirectory, RequestStore,
};
use crate::{compute_context_audit_hash, scope_organization, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Row};
use steward_types::{
    ActionKind, Actor, ActorId, AssociationId, Committee, CommitteeId, CommitteeVote,
    ContextAuditEvent, ContextAuditRecord, DispatchResult, ErrorBody, IdempotencyClaim,
    IdempotencyRecord, IdempotencyStatus, InvocationLogEntry, Notice, NoticeKind, OrganizationId,
    RequestId, RequestStatus, ReviewRequest, TenantScope, VoteAction,
};

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStewardStorage {
    pool: PgPool,
}

impl PostgresStewardStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS steward_organizations (
                organization_id TEXT PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_associations (
                organization_id TEXT NOT NULL REFERENCES steward_organizations(organization_id),
                association_id TEXT NOT NULL,
                PRIMARY KEY (organization_id, association_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_principals (
                actor_id TEXT PRIMARY KEY,
                home_organization TEXT,
                privileged BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_memberships (
                organization_id TEXT NOT NULL REFERENCES steward_organizations(organization_id),
                actor_id TEXT NOT NULL,
                PRIMARY KEY (organization_id, actor_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_context_audit (
                sequence BIGINT PRIMARY KEY,
                event TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                association_id TEXT,
                actor_id TEXT NOT NULL,
                privileged BOOLEAN NOT NULL,
                cross_tenant BOOLEAN NOT NULL,
                reason TEXT,
                target_item_type TEXT,
                target_item_id TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_idempotency (
                organization_id TEXT NOT NULL,
                idem_key TEXT NOT NULL,
                family TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                result JSONB,
                error JSONB,
                attempts INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                lease_expires_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (organization_id, idem_key)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS steward_idempotency_expires_idx
                ON steward_idempotency (expires_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_invocations (
                organization_id TEXT NOT NULL,
                idem_key TEXT NOT NULL,
                action TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                invocation JSONB NOT NULL,
                status TEXT NOT NULL,
                result JSONB,
                attempts INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (organization_id, idem_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_requests (
                request_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                association_id TEXT,
                title TEXT NOT NULL,
                description TEXT,
                submitted_by TEXT NOT NULL,
                committee_id TEXT NOT NULL,
                status TEXT NOT NULL,
                round INTEGER NOT NULL,
                creation_key TEXT NOT NULL,
                history JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (organization_id, creation_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_committees (
                committee_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                association_id TEXT,
                members JSONB NOT NULL,
                config JSONB NOT NULL,
                PRIMARY KEY (organization_id, committee_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_votes (
                vote_id BIGSERIAL PRIMARY KEY,
                request_id TEXT NOT NULL REFERENCES steward_requests(request_id),
                round INTEGER NOT NULL,
                reviewer_id TEXT NOT NULL,
                action TEXT NOT NULL,
                notes TEXT,
                conditions TEXT,
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS steward_votes_request_idx
                ON steward_votes (request_id, round)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_notices (
                notice_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                association_id TEXT,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                round INTEGER NOT NULL,
                transition_key TEXT NOT NULL,
                recipient TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                delivered_at TIMESTAMPTZ,
                UNIQUE (organization_id, request_id, transition_key)
            )
            "#,
        ];

        for statement in ddl {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    // ── Directory administration ────────────────────────────────────

    pub async fn register_organization(&self, organization: &OrganizationId) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO steward_organizations (organization_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(organization.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn register_association(
        &self,
        organization: &OrganizationId,
        association: &AssociationId,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steward_associations (organization_id, association_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(organization.as_str())
        .bind(association.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn register_principal(&self, actor: &Actor) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steward_principals (actor_id, home_organization, privileged)
            VALUES ($1, $2, $3)
            ON CONFLICT (actor_id) DO UPDATE
               SET home_organization = EXCLUDED.home_organization,
                   privileged = EXCLUDED.privileged
            "#,
        )
        .bind(actor.id.as_str())
        .bind(actor.home_organization.as_ref().map(|o| o.as_str()))
        .bind(actor.privileged)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn add_member(&self, organization: &OrganizationId, actor: &Actor) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steward_memberships (organization_id, actor_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(organization.as_str())
        .bind(actor.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.register_principal(actor).await
    }
}

/// SQL filter values for a scope: organization, plus association unless the
/// scope sees the whole organization.
fn scope_filter(scope: &TenantScope) -> StorageResult<(String, Option<String>)> {
    let ctx = scope
        .context()
        .ok_or_else(|| StorageError::Denied("no tenant context".to_string()))?;
    let association = if ctx.privileged_override {
        None
    } else {
        ctx.association_id.as_ref().map(|a| a.0.clone())
    };
    Ok((ctx.organization_id.0.clone(), association))
}

#[async_trait]
impl OrganizationDirectory for PostgresStewardStorage {
    async fn organization_exists(&self, organization: &OrganizationId) -> StorageResult<bool> {
        let row = sqlx::query("SELECT 1 FROM steward_organizations WHERE organization_id = $1")
            .bind(organization.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn association_in_organization(
        &self,
        organization: &OrganizationId,
        association: &AssociationId,
    ) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM steward_associations WHERE organization_id = $1 AND association_id = $2",
        )
        .bind(organization.as_str())
        .bind(association.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn is_member(&self, organization: &OrganizationId, actor: &ActorId) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM steward_memberships WHERE organization_id = $1 AND actor_id = $2",
        )
        .bind(organization.as_str())
        .bind(actor.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn principal(&self, actor: &ActorId) -> StorageResult<Option<Actor>> {
        let row = sqlx::query(
            "SELECT actor_id, home_organization, privileged FROM steward_principals WHERE actor_id = $1",
        )
        .bind(actor.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| -> StorageResult<Actor> {
            let home: Option<String> = get(&row, "home_organization")?;
            Ok(Actor {
                id: ActorId::new(get::<String>(&row, "actor_id")?),
                home_organization: home.map(OrganizationId::new),
                privileged: get(&row, "privileged")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ContextAuditStore for PostgresStewardStorage {
    async fn append_context_audit(
        &self,
        mut record: ContextAuditRecord,
    ) -> StorageResult<ContextAuditRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("LOCK TABLE steward_context_audit IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM steward_context_audit ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = match last {
            Some(row) => (get::<i64>(&row, "sequence")? + 1, get::<String>(&row, "hash")?),
            None => (1_i64, String::new()),
        };

        record.hash = compute_context_audit_hash(&record, &previous_hash, sequence as u64)?;
        record.sequence = sequence as u64;
        record.previous_hash = previous_hash;

        sqlx::query(
            r#"
            INSERT INTO steward_context_audit
                (sequence, event, organization_id, association_id, actor_id, privileged, cross_tenant,
                 reason, target_item_type, target_item_id, timestamp, previous_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(sequence)
        .bind(record.event.as_str())
        .bind(record.organization_id.as_str())
        .bind(record.association_id.as_ref().map(|a| a.as_str()))
        .bind(record.actor_id.as_str())
        .bind(record.privileged)
        .bind(record.cross_tenant)
        .bind(record.reason.clone())
        .bind(record.target_item_type.clone())
        .bind(record.target_item_id.clone())
        .bind(record.timestamp)
        .bind(record.previous_hash.clone())
        .bind(record.hash.clone())
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(record)
    }

    async fn list_context_audit(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<ContextAuditRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            to_i64(window.limit)?
        };
        let rows = sqlx::query(
            r#"
            SELECT sequence, event, organization_id, association_id, actor_id, privileged, cross_tenant,
                   reason, target_item_type, target_item_id, timestamp, previous_hash, hash
              FROM steward_context_audit
             ORDER BY sequence DESC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(context_audit_row_to_record).collect()
    }
}

const IDEMPOTENCY_COLUMNS: &str = "organization_id, idem_key, family, fingerprint, status, result, error, attempts, created_at, updated_at, lease_expires_at, expires_at";

#[async_trait]
impl IdempotencyStore for PostgresStewardStorage {
    async fn try_begin(
        &self,
        scope: &TenantScope,
        key: &str,
        claim: &IdempotencyClaim,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<BeginOutcome> {
        let organization = scope_organization(scope)?;
        let acquired = sqlx::query(&format!(
            r#"
            INSERT INTO steward_idempotency AS cur ({IDEMPOTENCY_COLUMNS})
            VALUES ($1, $2, $3, $4, 'PENDING', NULL, NULL, 1, $5, $5, $6, $7)
            ON CONFLICT (organization_id, idem_key) DO UPDATE
               SET family = EXCLUDED.family,
                   fingerprint = EXCLUDED.fingerprint,
                   status = 'PENDING',
                   result = NULL,
                   error = NULL,
                   attempts = CASE WHEN cur.expires_at <= $5 THEN 1 ELSE cur.attempts + 1 END,
                   created_at = CASE WHEN cur.expires_at <= $5 THEN EXCLUDED.created_at ELSE cur.created_at END,
                   updated_at = EXCLUDED.updated_at,
                   lease_expires_at = EXCLUDED.lease_expires_at,
                   expires_at = EXCLUDED.expires_at
             WHERE cur.expires_at <= $5
                OR (cur.family = EXCLUDED.family
                    AND (cur.status = 'FAILED'
                         OR (cur.status = 'PENDING' AND cur.lease_expires_at <= $5)))
            RETURNING {IDEMPOTENCY_COLUMNS}
            "#
        ))
        .bind(organization.as_str())
        .bind(key)
        .bind(claim.family.clone())
        .bind(claim.fingerprint.clone())
        .bind(now)
        .bind(lease_expires_at)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if let Some(row) = acquired {
            return Ok(BeginOutcome::Acquired(idempotency_row_to_record(row)?));
        }

        let existing = self.get_record(scope, key).await?.ok_or_else(|| {
            StorageError::Conflict(format!("idempotency key {key} changed concurrently"))
        })?;
        Ok(BeginOutcome::Existing(existing))
    }

    async fn complete(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?;
        let outcome = sqlx::query(
            r#"
            UPDATE steward_idempotency
               SET status = 'COMPLETED', result = $1, updated_at = $2
             WHERE organization_id = $3 AND idem_key = $4
               AND status = 'PENDING' AND attempts = $5
            "#,
        )
        .bind(result)
        .bind(now)
        .bind(organization.as_str())
        .bind(key)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        ensure_owned(outcome.rows_affected(), key, attempt)
    }

    async fn fail(
        &self,
        scope: &TenantScope,
        key: &str,
        attempt: u32,
        error: ErrorBody,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?;
        let outcome = sqlx::query(
            r#"
            UPDATE steward_idempotency
               SET status = 'FAILED', error = $1, updated_at = $2
             WHERE organization_id = $3 AND idem_key = $4
               AND status = 'PENDING' AND attempts = $5
            "#,
        )
        .bind(to_json(&error)?)
        .bind(now)
        .bind(organization.as_str())
        .bind(key)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        ensure_owned(outcome.rows_affected(), key, attempt)
    }

    async fn get_record(
        &self,
        scope: &TenantScope,
        key: &str,
    ) -> StorageResult<Option<IdempotencyRecord>> {
        let Some(organization) = scope.organization_id() else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM steward_idempotency WHERE organization_id = $1 AND idem_key = $2"
        ))
        .bind(organization.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(idempotency_row_to_record).transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let outcome = sqlx::query("DELETE FROM steward_idempotency WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(outcome.rows_affected())
    }
}

fn ensure_owned(rows_affected: u64, key: &str, attempt: u32) -> StorageResult<()> {
    if rows_affected == 0 {
        return Err(StorageError::Conflict(format!(
            "idempotency key {key} is no longer owned by attempt {attempt}"
        )));
    }
    Ok(())
}

const INVOCATION_COLUMNS: &str =
    "organization_id, idem_key, action, payload_hash, invocation, status, result, attempts, created_at, updated_at";

#[async_trait]
impl InvocationLogStore for PostgresStewardStorage {
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
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO steward_invocations AS cur ({INVOCATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, 'PENDING', NULL, 1, $6, $6)
            ON CONFLICT (organization_id, idem_key) DO UPDATE
               SET action = CASE WHEN cur.status = 'COMPLETED' THEN cur.action ELSE EXCLUDED.action END,
                   payload_hash = CASE WHEN cur.status = 'COMPLETED' THEN cur.payload_hash ELSE EXCLUDED.payload_hash END,
                   invocation = CASE WHEN cur.status = 'COMPLETED' THEN cur.invocation ELSE EXCLUDED.invocation END,
                   result = CASE WHEN cur.status = 'COMPLETED' THEN cur.result ELSE NULL END,
                   status = CASE WHEN cur.status = 'COMPLETED' THEN cur.status ELSE 'PENDING' END,
                   attempts = CASE WHEN cur.status = 'COMPLETED' THEN cur.attempts ELSE cur.attempts + 1 END,
                   updated_at = CASE WHEN cur.status = 'COMPLETED' THEN cur.updated_at ELSE EXCLUDED.updated_at END
            RETURNING {INVOCATION_COLUMNS}
            "#
        ))
        .bind(entry.organization_id.as_str())
        .bind(entry.idempotency_key.clone())
        .bind(entry.action.as_str())
        .bind(entry.payload_hash.clone())
        .bind(to_json(&entry.invocation)?)
        .bind(entry.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        invocation_row_to_entry(row)
    }

    async fn resolve_invocation(
        &self,
        scope: &TenantScope,
        key: &str,
        status: IdempotencyStatus,
        result: DispatchResult,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let organization = scope_organization(scope)?;
        let outcome = sqlx::query(
            r#"
            UPDATE steward_invocations
               SET status = $1, result = $2, updated_at = $3
             WHERE organization_id = $4 AND idem_key = $5
            "#,
        )
        .bind(status.as_str())
        .bind(to_json(&result)?)
        .bind(now)
        .bind(organization.as_str())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if outcome.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("invocation {key} not found")));
        }
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
        let row = sqlx::query(&format!(
            "SELECT {INVOCATION_COLUMNS} FROM steward_invocations WHERE organization_id = $1 AND idem_key = $2"
        ))
        .bind(organization.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(invocation_row_to_entry).transpose()
    }

    async fn stale_invocations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<InvocationLogEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INVOCATION_COLUMNS} FROM steward_invocations
             WHERE status = 'PENDING' AND updated_at <= $1
             ORDER BY created_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(invocation_row_to_entry).collect()
    }
}

const REQUEST_COLUMNS: &str = "request_id, organization_id, association_id, title, description, submitted_by, committee_id, status, round, creation_key, history, created_at, updated_at";

#[async_trait]
impl RequestStore for PostgresStewardStorage {
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
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO steward_requests ({REQUEST_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (organization_id, creation_key) DO NOTHING
            "#
        ))
        .bind(request.id.as_str())
        .bind(request.organization_id.as_str())
        .bind(request.association_id.as_ref().map(|a| a.as_str()))
        .bind(request.title.clone())
        .bind(request.description.clone())
        .bind(request.submitted_by.as_str())
        .bind(request.committee_id.as_str())
        .bind(request.status.as_str())
        .bind(request.round as i32)
        .bind(request.creation_key.clone())
        .bind(to_json(&request.history)?)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if inserted.rows_affected() == 1 {
            return Ok(CreateOutcome::Created(request));
        }
        let existing = self
            .find_by_creation_key(scope, &request.creation_key)
            .await?
            .ok_or_else(|| {
                StorageError::Conflict(format!(
                    "creation key {} is held by a request outside scope",
                    request.creation_key
                ))
            })?;
        Ok(CreateOutcome::Existing(existing))
    }

    async fn get_request(
        &self,
        scope: &TenantScope,
        id: &RequestId,
    ) -> StorageResult<Option<ReviewRequest>> {
        let Ok((organization, association)) = scope_filter(scope) else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM steward_requests
             WHERE request_id = $1 AND organization_id = $2
               AND ($3::TEXT IS NULL OR association_id = $3)
            "#
        ))
        .bind(id.as_str())
        .bind(organization)
        .bind(association)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(request_row_to_record).transpose()
    }

    async fn find_by_creation_key(
        &self,
        scope: &TenantScope,
        creation_key: &str,
    ) -> StorageResult<Option<ReviewRequest>> {
        let Ok((organization, association)) = scope_filter(scope) else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM steward_requests
             WHERE organization_id = $1 AND creation_key = $2
               AND ($3::TEXT IS NULL OR association_id = $3)
            "#
        ))
        .bind(organization)
        .bind(creation_key)
        .bind(association)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(request_row_to_record).transpose()
    }

    async fn transition_status(
        &self,
        scope: &TenantScope,
        id: &RequestId,
        change: StatusChange,
    ) -> StorageResult<ReviewRequest> {
        let (organization, association) = scope_filter(scope)?;
        let key = change.transition.idempotency_key.clone();
        let entry = to_json(&vec![&change.transition])?;
        let applied_marker = serde_json::json!([{ "idempotency_key": key }]);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE steward_requests
               SET status = $1,
                   round = round + $2,
                   history = history || $3::JSONB,
                   updated_at = $4
             WHERE request_id = $5 AND organization_id = $6
               AND ($7::TEXT IS NULL OR association_id = $7)
               AND status = $8
               AND NOT (history @> $9::JSONB)
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(change.transition.to.as_str())
        .bind(if change.bump_round { 1_i32 } else { 0_i32 })
        .bind(entry)
        .bind(change.transition.at)
        .bind(id.as_str())
        .bind(organization)
        .bind(association)
        .bind(change.expected.as_str())
        .bind(applied_marker)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if let Some(row) = row {
            if let Some(vote) = &change.vote {
                insert_vote(&mut *conn, vote).await?;
            }
            tx.commit()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            return request_row_to_record(row);
        }
        drop(tx);

        let current = self
            .get_request(scope, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("request {id} not found")))?;
        if current.applied_by(&key).is_some() {
            return Err(StorageError::Conflict(format!(
                "transition {key} already applied to request {id}"
            )));
        }
        Err(StorageError::StaleStatus {
            expected: change.expected,
            actual: current.status,
        })
    }
}

#[async_trait]
impl CommitteeStore for PostgresStewardStorage {
    async fn put_committee(&self, scope: &TenantScope, committee: Committee) -> StorageResult<()> {
        if !scope.permits(&committee.organization_id, committee.association_id.as_ref()) {
            return Err(StorageError::Denied(format!(
                "committee {} outside scope",
                committee.committee_id
            )));
        }
        let (_, visible_association) = scope_filter(scope)?;
        let written = sqlx::query(
            r#"
            INSERT INTO steward_committees (committee_id, organization_id, association_id, members, config)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (organization_id, committee_id) DO UPDATE
               SET association_id = EXCLUDED.association_id,
                   members = EXCLUDED.members,
                   config = EXCLUDED.config
             WHERE $6::TEXT IS NULL OR steward_committees.association_id = $6
            "#,
        )
        .bind(committee.committee_id.as_str())
        .bind(committee.organization_id.as_str())
        .bind(committee.association_id.as_ref().map(|a| a.as_str()))
        .bind(to_json(&committee.members)?)
        .bind(to_json(&committee.config)?)
        .bind(visible_association)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if written.rows_affected() == 0 {
            return Err(StorageError::Denied(format!(
                "committee {} outside scope",
                committee.committee_id
            )));
        }
        Ok(())
    }

    async fn get_committee(
        &self,
        scope: &TenantScope,
        id: &CommitteeId,
    ) -> StorageResult<Option<Committee>> {
        let Ok((organization, association)) = scope_filter(scope) else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT committee_id, organization_id, association_id, members, config
              FROM steward_committees
             WHERE committee_id = $1 AND organization_id = $2
               AND ($3::TEXT IS NULL OR association_id = $3)
            "#,
        )
        .bind(id.as_str())
        .bind(organization)
        .bind(association)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| -> StorageResult<Committee> {
            let association: Option<String> = get(&row, "association_id")?;
            Ok(Committee {
                committee_id: CommitteeId::new(get::<String>(&row, "committee_id")?),
                organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
                association_id: association.map(AssociationId::new),
                members: from_json(get(&row, "members")?)?,
                config: from_json(get(&row, "config")?)?,
            })
        })
        .transpose()
    }

    async fn append_vote(&self, scope: &TenantScope, vote: CommitteeVote) -> StorageResult<()> {
        if self.get_request(scope, &vote.request_id).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "request {} not found",
                vote.request_id
            )));
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        insert_vote(&mut *conn, &vote).await
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
        let rows = sqlx::query(
            r#"
            SELECT request_id, round, reviewer_id, action, notes, conditions, expires_at, created_at
              FROM steward_votes
             WHERE request_id = $1 AND round = $2
             ORDER BY vote_id ASC
            "#,
        )
        .bind(request_id.as_str())
        .bind(round as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(vote_row_to_record).collect()
    }
}

#[async_trait]
impl NoticeOutbox for PostgresStewardStorage {
    async fn enqueue_notice(&self, scope: &TenantScope, notice: Notice) -> StorageResult<bool> {
        if !scope.permits(&notice.organization_id, notice.association_id.as_ref()) {
            return Err(StorageError::Denied(format!(
                "notice for request {} outside scope",
                notice.request_id
            )));
        }
        let outcome = sqlx::query(
            r#"
            INSERT INTO steward_notices
                (notice_id, organization_id, association_id, request_id, kind, round, transition_key, recipient, created_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL)
            ON CONFLICT (organization_id, request_id, transition_key) DO NOTHING
            "#,
        )
        .bind(notice.notice_id.clone())
        .bind(notice.organization_id.as_str())
        .bind(notice.association_id.as_ref().map(|a| a.as_str()))
        .bind(notice.request_id.as_str())
        .bind(notice_kind_to_str(notice.kind))
        .bind(notice.round as i32)
        .bind(notice.transition_key.clone())
        .bind(notice.recipient.as_str())
        .bind(notice.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn pending_notices(&self, scope: &TenantScope) -> StorageResult<Vec<Notice>> {
        let Ok((organization, association)) = scope_filter(scope) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT notice_id, organization_id, association_id, request_id, kind, round, transition_key, recipient, created_at, delivered_at
              FROM steward_notices
             WHERE organization_id = $1
               AND ($2::TEXT IS NULL OR association_id = $2)
               AND delivered_at IS NULL
             ORDER BY created_at ASC
            "#,
        )
        .bind(organization)
        .bind(association)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(notice_row_to_record).collect()
    }

    async fn mark_delivered(
        &self,
        scope: &TenantScope,
        notice_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let (organization, association) = scope_filter(scope)?;
        let outcome = sqlx::query(
            r#"
            UPDATE steward_notices SET delivered_at = $1
             WHERE notice_id = $2 AND organization_id = $3
               AND ($4::TEXT IS NULL OR association_id = $4)
            "#,
        )
        .bind(at)
        .bind(notice_id)
        .bind(organization)
        .bind(association)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if outcome.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("notice {notice_id} not found")));
        }
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn get<T>(row: &PgRow, column: &str) -> StorageResult<T>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StorageError::Backend(e.to_string()))
}

fn context_audit_row_to_record(row: PgRow) -> StorageResult<ContextAuditRecord> {
    let event: String = get(&row, "event")?;
    let association: Option<String> = get(&row, "association_id")?;
    Ok(ContextAuditRecord {
        event: match event.as_str() {
            "ACTIVATED" => ContextAuditEvent::Activated,
            "RELEASED" => ContextAuditEvent::Released,
            other => {
                return Err(StorageError::Serialization(format!(
                    "unknown context audit event: {other}"
                )))
            }
        },
        organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
        association_id: association.map(AssociationId::new),
        actor_id: ActorId::new(get::<String>(&row, "actor_id")?),
        privileged: get(&row, "privileged")?,
        cross_tenant: get(&row, "cross_tenant")?,
        reason: get(&row, "reason")?,
        target_item_type: get(&row, "target_item_type")?,
        target_item_id: get(&row, "target_item_id")?,
        timestamp: get(&row, "timestamp")?,
        sequence: get::<i64>(&row, "sequence")? as u64,
        previous_hash: get(&row, "previous_hash")?,
        hash: get(&row, "hash")?,
    })
}

fn idempotency_row_to_record(row: PgRow) -> StorageResult<IdempotencyRecord> {
    let status: String = get(&row, "status")?;
    let error: Option<serde_json::Value> = get(&row, "error")?;
    Ok(IdempotencyRecord {
        organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
        key: get(&row, "idem_key")?,
        family: get(&row, "family")?,
        fingerprint: get(&row, "fingerprint")?,
        status: parse_idempotency_status(&status)?,
        result: get(&row, "result")?,
        error: error.map(from_json).transpose()?,
        attempts: get::<i32>(&row, "attempts")? as u32,
        created_at: get(&row, "created_at")?,
        updated_at: get(&row, "updated_at")?,
        lease_expires_at: get(&row, "lease_expires_at")?,
        expires_at: get(&row, "expires_at")?,
    })
}

fn invocation_row_to_entry(row: PgRow) -> StorageResult<InvocationLogEntry> {
    let action: String = get(&row, "action")?;
    let status: String = get(&row, "status")?;
    let result: Option<serde_json::Value> = get(&row, "result")?;
    Ok(InvocationLogEntry {
        organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
        idempotency_key: get(&row, "idem_key")?,
        action: ActionKind::parse(&action).ok_or_else(|| {
            StorageError::Serialization(format!("unknown action kind: {action}"))
        })?,
        payload_hash: get(&row, "payload_hash")?,
        invocation: from_json(get(&row, "invocation")?)?,
        status: parse_idempotency_status(&status)?,
        result: result.map(from_json).transpose()?,
        attempts: get::<i32>(&row, "attempts")? as u32,
        created_at: get(&row, "created_at")?,
        updated_at: get(&row, "updated_at")?,
    })
}

fn request_row_to_record(row: PgRow) -> StorageResult<ReviewRequest> {
    let status: String = get(&row, "status")?;
    let association: Option<String> = get(&row, "association_id")?;
    Ok(ReviewRequest {
        id: RequestId::new(get::<String>(&row, "request_id")?),
        organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
        association_id: association.map(AssociationId::new),
        title: get(&row, "title")?,
        description: get(&row, "description")?,
        submitted_by: ActorId::new(get::<String>(&row, "submitted_by")?),
        committee_id: CommitteeId::new(get::<String>(&row, "committee_id")?),
        status: RequestStatus::parse(&status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown request status: {status}"))
        })?,
        round: get::<i32>(&row, "round")? as u32,
        creation_key: get(&row, "creation_key")?,
        history: from_json(get(&row, "history")?)?,
        created_at: get(&row, "created_at")?,
        updated_at: get(&row, "updated_at")?,
    })
}

async fn insert_vote(conn: &mut PgConnection, vote: &CommitteeVote) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO steward_votes
            (request_id, round, reviewer_id, action, notes, conditions, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(vote.request_id.as_str())
    .bind(vote.round as i32)
    .bind(vote.reviewer_id.as_str())
    .bind(vote.action.as_str())
    .bind(vote.notes.clone())
    .bind(vote.conditions.clone())
    .bind(vote.expires_at)
    .bind(vote.created_at)
    .execute(conn)
    .await
    .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(())
}

fn vote_row_to_record(row: PgRow) -> StorageResult<CommitteeVote> {
    let action: String = get(&row, "action")?;
    Ok(CommitteeVote {
        request_id: RequestId::new(get::<String>(&row, "request_id")?),
        round: get::<i32>(&row, "round")? as u32,
        reviewer_id: ActorId::new(get::<String>(&row, "reviewer_id")?),
        action: VoteAction::parse(&action)
            .ok_or_else(|| StorageError::Serialization(format!("unknown vote action: {action}")))?,
        notes: get(&row, "notes")?,
        conditions: get(&row, "conditions")?,
        expires_at: get(&row, "expires_at")?,
        created_at: get(&row, "created_at")?,
    })
}

fn notice_row_to_record(row: PgRow) -> StorageResult<Notice> {
    let kind: String = get(&row, "kind")?;
    let association: Option<String> = get(&row, "association_id")?;
    Ok(Notice {
        notice_id: get(&row, "notice_id")?,
        organization_id: OrganizationId::new(get::<String>(&row, "organization_id")?),
        association_id: association.map(AssociationId::new),
        request_id: RequestId::new(get::<String>(&row, "request_id")?),
        kind: from_json(serde_json::Value::String(kind))?,
        round: get::<i32>(&row, "round")? as u32,
        transition_key: get(&row, "transition_key")?,
        recipient: ActorId::new(get::<String>(&row, "recipient")?),
        created_at: get(&row, "created_at")?,
        delivered_at: get(&row, "delivered_at")?,
    })
}

fn notice_kind_to_str(kind: NoticeKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_idempotency_status(raw: &str) -> StorageResult<IdempotencyStatus> {
    IdempotencyStatus::parse(raw)
        .ok_or_else(|| StorageError::Serialization(format!("unknown idempotency status: {raw}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}
