//! Workflow actions, invocations, and the dispatch envelopes

use crate::{
    Actor, ActorId, AssociationId, CommitteeId, OrganizationId, RequestId, RequestStatus,
    StewardError, StewardResult, TenantContext, VoteAction,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Payloads ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub committee_id: CommitteeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginReviewPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVotePayload {
    pub vote: VoteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDecisionPayload {
    pub decision: VoteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubmitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Actions ─────────────────────────────────────────────────────────

/// Everything a caller may ask the dispatcher to do
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowAction {
    CreateRequest(CreateRequestPayload),
    BeginReview(BeginReviewPayload),
    CastVote(CastVotePayload),
    RecordDecision(RecordDecisionPayload),
    Resubmit(ResubmitPayload),
    Withdraw(WithdrawPayload),
}

impl WorkflowAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            WorkflowAction::CreateRequest(_) => ActionKind::CreateRequest,
            WorkflowAction::BeginReview(_) => ActionKind::BeginReview,
            WorkflowAction::CastVote(_) => ActionKind::CastVote,
            WorkflowAction::RecordDecision(_) => ActionKind::RecordDecision,
            WorkflowAction::Resubmit(_) => ActionKind::Resubmit,
            WorkflowAction::Withdraw(_) => ActionKind::Withdraw,
        }
    }

    /// Parse a wire action name and untyped payload into the typed action
    pub fn from_parts(action: &str, payload: serde_json::Value) -> StewardResult<Self> {
        if ActionKind::parse(action).is_none() {
            return Err(StewardError::UnknownAction(action.to_string()));
        }
        let payload = match payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let tagged = serde_json::json!({ "action": action, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| StewardError::InvalidPayload(e.to_string()))
    }
}

/// Payload-free discriminant of [`WorkflowAction`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    CreateRequest,
    BeginReview,
    CastVote,
    RecordDecision,
    Resubmit,
    Withdraw,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::CreateRequest,
        ActionKind::BeginReview,
        ActionKind::CastVote,
        ActionKind::RecordDecision,
        ActionKind::Resubmit,
        ActionKind::Withdraw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateRequest => "CREATE_REQUEST",
            ActionKind::BeginReview => "BEGIN_REVIEW",
            ActionKind::CastVote => "CAST_VOTE",
            ActionKind::RecordDecision => "RECORD_DECISION",
            ActionKind::Resubmit => "RESUBMIT",
            ActionKind::Withdraw => "WITHDRAW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Operation family recorded on idempotency records
    pub fn family(&self) -> &'static str {
        match self {
            ActionKind::CreateRequest => "review.create_request",
            ActionKind::BeginReview => "review.begin_review",
            ActionKind::CastVote => "review.cast_vote",
            ActionKind::RecordDecision => "review.record_decision",
            ActionKind::Resubmit => "review.resubmit",
            ActionKind::Withdraw => "review.withdraw",
        }
    }

    pub fn creates_entity(&self) -> bool {
        matches!(self, ActionKind::CreateRequest)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Invocation ──────────────────────────────────────────────────────

/// A fully typed request to run one workflow action
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInvocation {
    pub action: WorkflowAction,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<RequestId>,
    pub idempotency_key: String,
    #[serde(default)]
    pub privileged_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_reason: Option<String>,
}

impl WorkflowInvocation {
    pub fn new(
        action: WorkflowAction,
        organization_id: OrganizationId,
        actor: Actor,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            action,
            organization_id,
            association_id: None,
            actor,
            entity_id: None,
            idempotency_key: idempotency_key.into(),
            privileged_override: false,
            audit_reason: None,
        }
    }

    pub fn on_entity(mut self, entity_id: RequestId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn in_association(mut self, association_id: AssociationId) -> Self {
        self.association_id = Some(association_id);
        self
    }

    pub fn with_override(mut self, reason: impl Into<String>) -> Self {
        self.privileged_override = true;
        self.audit_reason = Some(reason.into());
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    /// The tenant context this invocation runs under
    pub fn tenant_context(&self) -> TenantContext {
        let mut ctx = TenantContext::new(self.organization_id.clone(), self.actor.clone());
        ctx.association_id = self.association_id.clone();
        ctx.privileged_override = self.privileged_override;
        ctx.audit_reason = self.audit_reason.clone();
        if let Some(entity) = &self.entity_id {
            ctx.target_item_type = Some("review_request".to_string());
            ctx.target_item_id = Some(entity.to_string());
        }
        ctx
    }
}

// ── Envelopes ───────────────────────────────────────────────────────

/// Untyped dispatch request as received from the route layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDispatchRequest {
    pub action: String,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub actor_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<RequestId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub privileged_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_reason: Option<String>,
}

/// Outcome of a dispatch. Errors are carried here, never thrown.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::ErrorKind>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl DispatchResult {
    pub fn applied(
        entity_id: RequestId,
        previous_status: Option<RequestStatus>,
        new_status: RequestStatus,
    ) -> Self {
        Self {
            success: true,
            entity_id: Some(entity_id),
            previous_status,
            new_status: Some(new_status),
            ..Default::default()
        }
    }

    pub fn failed(error: &StewardError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            retryable: error.is_retryable(),
            ..Default::default()
        }
    }
}
