//! Review requests: the workflow entity, its history, and outbound notices

use crate::{ActionKind, ActorId, AssociationId, CommitteeId, OrganizationId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Submitted,
    UnderReview,
    ChangesRequested,
    Tabled,
    Approved,
    Denied,
    Withdrawn,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 7] = [
        RequestStatus::Submitted,
        RequestStatus::UnderReview,
        RequestStatus::ChangesRequested,
        RequestStatus::Tabled,
        RequestStatus::Approved,
        RequestStatus::Denied,
        RequestStatus::Withdrawn,
    ];

    /// Terminal statuses accept no further actions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved | RequestStatus::Denied | RequestStatus::Withdrawn
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Submitted => "SUBMITTED",
            RequestStatus::UnderReview => "UNDER_REVIEW",
            RequestStatus::ChangesRequested => "CHANGES_REQUESTED",
            RequestStatus::Tabled => "TABLED",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Denied => "DENIED",
            RequestStatus::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition, written atomically with the status change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Key of the invocation that applied this transition
    pub idempotency_key: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
}

/// An architectural review request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: RequestId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub submitted_by: ActorId,
    pub committee_id: CommitteeId,
    pub status: RequestStatus,
    /// Starts at 1; bumped on every resubmission
    pub round: u32,
    /// Idempotency key of the creating invocation, unique per organization
    pub creation_key: String,
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewRequest {
    /// The transition applied under `key`, if any
    pub fn applied_by(&self, key: &str) -> Option<&TransitionRecord> {
        self.history.iter().find(|t| t.idempotency_key == key)
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.last()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeKind {
    Submitted,
    ReviewStarted,
    Approved,
    Denied,
    ChangesRequested,
    Tabled,
    Withdrawn,
}

impl NoticeKind {
    /// The notice emitted when a request enters `status`
    pub fn for_status(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Submitted => NoticeKind::Submitted,
            RequestStatus::UnderReview => NoticeKind::ReviewStarted,
            RequestStatus::ChangesRequested => NoticeKind::ChangesRequested,
            RequestStatus::Tabled => NoticeKind::Tabled,
            RequestStatus::Approved => NoticeKind::Approved,
            RequestStatus::Denied => NoticeKind::Denied,
            RequestStatus::Withdrawn => NoticeKind::Withdrawn,
        }
    }
}

/// Outbox entry for the external notification collaborator.
///
/// One per applied transition: unique on `(organization, request,
/// transition_key)`, where the transition key is the idempotency key that
/// applied it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub notice_id: String,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub request_id: RequestId,
    pub kind: NoticeKind,
    pub round: u32,
    pub transition_key: String,
    pub recipient: ActorId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Notice {
    pub fn for_request(request: &ReviewRequest, kind: NoticeKind, transition_key: impl Into<String>) -> Self {
        Self {
            notice_id: uuid::Uuid::new_v4().to_string(),
            organization_id: request.organization_id.clone(),
            association_id: request.association_id.clone(),
            request_id: request.id.clone(),
            kind,
            round: request.round,
            transition_key: transition_key.into(),
            recipient: request.submitted_by.clone(),
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    pub fn dedup_key(&self) -> (&OrganizationId, &RequestId, &str) {
        (&self.organization_id, &self.request_id, &self.transition_key)
    }
}
