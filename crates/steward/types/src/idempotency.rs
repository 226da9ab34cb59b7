//! Idempotency ledger records

use crate::{ErrorBody, OrganizationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(IdempotencyStatus::Pending),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller claims the key is for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyClaim {
    /// Logical operation family, e.g. `review.cast_vote`
    pub family: String,
    /// Hash of the request payload
    pub fingerprint: String,
}

impl IdempotencyClaim {
    pub fn new(family: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// Dedup ledger entry for one `(organization, key)` pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub organization_id: OrganizationId,
    pub key: String,
    pub family: String,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Incremented every time the key is (re-)acquired
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// A PENDING record past this instant is treated as FAILED
    pub lease_expires_at: DateTime<Utc>,
    /// Retention cutoff; expired records are ignored and purged
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        organization_id: OrganizationId,
        key: impl Into<String>,
        claim: &IdempotencyClaim,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            organization_id,
            key: key.into(),
            family: claim.family.clone(),
            fingerprint: claim.fingerprint.clone(),
            status: IdempotencyStatus::Pending,
            result: None,
            error: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
            lease_expires_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Pending && self.lease_expires_at <= now
    }

    /// A new caller may take over this key
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) || self.status == IdempotencyStatus::Failed || self.lease_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reclaimable_states() {
        let now = Utc::now();
        let claim = IdempotencyClaim::new("review.create", "abc");
        let mut rec = IdempotencyRecord::pending(
            OrganizationId::new("org"),
            "k1",
            &claim,
            now,
            now + Duration::seconds(30),
            now + Duration::hours(24),
        );
        assert!(!rec.is_reclaimable(now));
        assert!(rec.is_reclaimable(now + Duration::seconds(31)));

        rec.status = IdempotencyStatus::Completed;
        assert!(!rec.is_reclaimable(now + Duration::seconds(31)));
        assert!(rec.is_reclaimable(now + Duration::hours(25)));

        rec.status = IdempotencyStatus::Failed;
        assert!(rec.is_reclaimable(now));
    }
}
