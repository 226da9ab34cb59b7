use crate::state_machine::ReviewStateMachine;
use crate::StewardConfig;
use chrono::Utc;
use std::sync::Arc;
use steward_decision::DecisionEngine;
use steward_idempotency::{fingerprint, IdempotencyGuard};
use steward_storage::{StatusChange, StewardStorage};
use steward_tenancy::TenantContextManager;
use steward_types::{
    Actor, ActionKind, CastVotePayload, Committee, CommitteeVote, CreateRequestPayload,
    DispatchResult, IdempotencyClaim, IdempotencyStatus, InvocationLogEntry, Notice, NoticeKind,
    RecordDecisionPayload, RequestId, RequestStatus, ReviewRequest, StewardError, StewardResult,
    TenantScope, TransitionRecord, WireDispatchRequest, WorkflowAction, WorkflowInvocation,
};
use tracing::{debug, info, warn};

/// Routes workflow actions through tenant scope, idempotency, and decision
/// policy before mutating a review request.
pub struct Dispatcher<S: ?Sized> {
    storage: Arc<S>,
    tenancy: TenantContextManager<S>,
    guard: IdempotencyGuard<S>,
    decisions: DecisionEngine,
    config: StewardConfig,
}

impl<S> Dispatcher<S>
where
    S: StewardStorage + ?Sized + 'static,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_config(storage, StewardConfig::default())
    }

    pub fn with_config(storage: Arc<S>, config: StewardConfig) -> Self {
        Self {
            tenancy: TenantContextManager::with_config(storage.clone(), config.tenancy.clone()),
            guard: IdempotencyGuard::new(storage.clone(), config.idempotency.clone()),
            decisions: DecisionEngine::new(),
            storage,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn tenancy(&self) -> &TenantContextManager<S> {
        &self.tenancy
    }

    pub fn guard(&self) -> &IdempotencyGuard<S> {
        &self.guard
    }

    /// Dispatch one workflow action.
    ///
    /// Never fails: every error is reported in the returned envelope.
    pub async fn dispatch(&self, invocation: WorkflowInvocation) -> DispatchResult {
        let kind = invocation.kind();
        let organization_id = invocation.organization_id.clone();
        let idempotency_key = invocation.idempotency_key.clone();

        match self.try_dispatch(invocation).await {
            Ok(result) => {
                info!(
                    organization_id = %organization_id,
                    idempotency_key = %idempotency_key,
                    action = %kind,
                    request_id = ?result.entity_id,
                    new_status = ?result.new_status,
                    "workflow action applied"
                );
                result
            }
            Err(e) => {
                warn!(
                    organization_id = %organization_id,
                    idempotency_key = %idempotency_key,
                    action = %kind,
                    error_kind = %e.kind(),
                    error = %e,
                    "workflow action rejected"
                );
                DispatchResult::failed(&e)
            }
        }
    }

    /// Parse and dispatch a wire request.
    pub async fn dispatch_wire(&self, request: WireDispatchRequest) -> DispatchResult {
        match self.from_wire(request).await {
            Ok(invocation) => self.dispatch(invocation).await,
            Err(e) => {
                warn!(error = %e, "malformed dispatch request");
                DispatchResult::failed(&e)
            }
        }
    }

    /// Build a typed invocation from its wire form.
    ///
    /// The actor's privilege and home tenant come from the directory, never
    /// from the request itself.
    pub async fn from_wire(&self, request: WireDispatchRequest) -> StewardResult<WorkflowInvocation> {
        let idempotency_key = request
            .idempotency_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(StewardError::MissingIdempotencyKey)?;
        let action = WorkflowAction::from_parts(&request.action, request.payload)?;
        let actor = self
            .storage
            .principal(&request.actor_id)
            .await?
            .unwrap_or_else(|| Actor::new(request.actor_id));

        Ok(WorkflowInvocation {
            action,
            organization_id: request.organization_id,
            association_id: request.association_id,
            actor,
            entity_id: request.entity_id,
            idempotency_key,
            privileged_override: request.privileged_override,
            audit_reason: request.audit_reason,
        })
    }

    async fn try_dispatch(&self, invocation: WorkflowInvocation) -> StewardResult<DispatchResult> {
        if invocation.idempotency_key.trim().is_empty() {
            return Err(StewardError::MissingIdempotencyKey);
        }
        let kind = invocation.kind();
        if !kind.creates_entity() && invocation.entity_id.is_none() {
            return Err(StewardError::MissingEntityId(kind.as_str().to_string()));
        }

        let ctx = invocation.tenant_context();
        self.tenancy
            .with_context(ctx, |scope| async move { self.run_scoped(&scope, invocation).await })
            .await
    }

    async fn run_scoped(
        &self,
        scope: &TenantScope,
        invocation: WorkflowInvocation,
    ) -> StewardResult<DispatchResult> {
        let kind = invocation.kind();
        let key = invocation.idempotency_key.clone();
        let payload_hash = fingerprint(&(&invocation.entity_id, &invocation.action))?;

        // The log entry is written only once this caller owns the key, so a
        // rejected duplicate never re-arms someone else's invocation.
        let claim = IdempotencyClaim::new(kind.family(), payload_hash.clone());
        let (logged, hash) = (&invocation, payload_hash.as_str());
        let outcome = self
            .guard
            .execute(scope, &key, claim, || async move {
                self.log_attempt(scope, logged, hash).await?;
                self.apply(scope, logged).await
            })
            .await;

        let resolution = match &outcome {
            Ok(result) => Some((IdempotencyStatus::Completed, result.clone())),
            // Another owner is still running this key, or it belongs to a
            // different operation; neither ran here.
            Err(StewardError::InProgress(_)) | Err(StewardError::KeyReuse { .. }) => None,
            Err(e) => Some((IdempotencyStatus::Failed, DispatchResult::failed(e))),
        };
        if let Some((status, result)) = resolution {
            if let Err(e) = self
                .storage
                .resolve_invocation(scope, &key, status, result, Utc::now())
                .await
            {
                warn!(idempotency_key = %key, error = %e, "failed to resolve invocation log entry");
            }
        }

        outcome
    }

    async fn log_attempt(
        &self,
        scope: &TenantScope,
        invocation: &WorkflowInvocation,
        payload_hash: &str,
    ) -> StewardResult<()> {
        let entry = self
            .storage
            .log_invocation(
                scope,
                InvocationLogEntry::pending(invocation.clone(), payload_hash, Utc::now()),
            )
            .await?;
        debug!(
            organization_id = %entry.organization_id,
            idempotency_key = %entry.idempotency_key,
            attempt = entry.attempts,
            "invocation logged"
        );
        Ok(())
    }

    /// The guarded mutation. Every write here is either the single
    /// compare-and-set on the request or keyed so a replay cannot duplicate it.
    async fn apply(
        &self,
        scope: &TenantScope,
        invocation: &WorkflowInvocation,
    ) -> StewardResult<DispatchResult> {
        let key = invocation.idempotency_key.as_str();

        let request_id = match &invocation.action {
            WorkflowAction::CreateRequest(payload) => {
                return self.create_request(scope, invocation, payload).await;
            }
            _ => invocation
                .entity_id
                .clone()
                .ok_or_else(|| StewardError::MissingEntityId(invocation.kind().as_str().to_string()))?,
        };

        let request = self.load_request(scope, &request_id).await?;

        if let Some(applied) = request.applied_by(key) {
            debug!(
                request_id = %request.id,
                idempotency_key = key,
                "transition already applied, completing side effects"
            );
            let result = DispatchResult::applied(request.id.clone(), applied.from, applied.to);
            if invocation.kind() != ActionKind::CastVote {
                self.journal_notice(scope, &request, applied.to, key).await?;
            }
            return Ok(result);
        }

        let target = ReviewStateMachine::target(&invocation.action, request.status)?;

        let vote = match &invocation.action {
            WorkflowAction::CastVote(payload) => {
                Some(self.prepare_vote(scope, invocation, &request, payload).await?)
            }
            WorkflowAction::RecordDecision(payload) => {
                self.check_decision(scope, invocation, &request, payload).await?;
                None
            }
            WorkflowAction::CreateRequest(_)
            | WorkflowAction::BeginReview(_)
            | WorkflowAction::Resubmit(_)
            | WorkflowAction::Withdraw(_) => None,
        };

        let change = StatusChange {
            expected: request.status,
            transition: TransitionRecord {
                idempotency_key: key.to_string(),
                action: invocation.kind(),
                from: Some(request.status),
                to: target,
                actor: invocation.actor.id.clone(),
                at: Utc::now(),
            },
            bump_round: ReviewStateMachine::starts_round(invocation.kind()),
            vote,
        };
        let updated = self
            .storage
            .transition_status(scope, &request.id, change)
            .await?;

        info!(
            organization_id = %updated.organization_id,
            request_id = %updated.id,
            idempotency_key = key,
            from = %request.status,
            to = %updated.status,
            round = updated.round,
            "review request transitioned"
        );

        if invocation.kind() != ActionKind::CastVote {
            self.journal_notice(scope, &updated, target, key).await?;
        }

        Ok(DispatchResult::applied(
            updated.id,
            Some(request.status),
            target,
        ))
    }

    async fn create_request(
        &self,
        scope: &TenantScope,
        invocation: &WorkflowInvocation,
        payload: &CreateRequestPayload,
    ) -> StewardResult<DispatchResult> {
        let key = invocation.idempotency_key.as_str();

        if let Some(existing) = self.storage.find_by_creation_key(scope, key).await? {
            debug!(
                request_id = %existing.id,
                idempotency_key = key,
                "request already created, completing side effects"
            );
            self.journal_notice(scope, &existing, RequestStatus::Submitted, key).await?;
            return Ok(DispatchResult::applied(existing.id, None, RequestStatus::Submitted));
        }

        if payload.title.trim().is_empty() {
            return Err(StewardError::InvalidPayload("title must not be blank".to_string()));
        }
        let committee = self
            .storage
            .get_committee(scope, &payload.committee_id)
            .await?
            .ok_or_else(|| StewardError::CommitteeNotFound(payload.committee_id.clone()))?;

        let now = Utc::now();
        let request = ReviewRequest {
            id: RequestId::generate(),
            organization_id: invocation.organization_id.clone(),
            association_id: invocation
                .association_id
                .clone()
                .or_else(|| committee.association_id.clone()),
            title: payload.title.trim().to_string(),
            description: payload.description.clone(),
            submitted_by: invocation.actor.id.clone(),
            committee_id: committee.committee_id.clone(),
            status: RequestStatus::Submitted,
            round: 1,
            creation_key: key.to_string(),
            history: vec![TransitionRecord {
                idempotency_key: key.to_string(),
                action: ActionKind::CreateRequest,
                from: None,
                to: RequestStatus::Submitted,
                actor: invocation.actor.id.clone(),
                at: now,
            }],
            created_at: now,
            updated_at: now,
        };

        let created = self.storage.create_request(scope, request).await?.into_request();
        info!(
            organization_id = %created.organization_id,
            request_id = %created.id,
            committee_id = %created.committee_id,
            idempotency_key = key,
            "review request created"
        );

        self.journal_notice(scope, &created, RequestStatus::Submitted, key).await?;
        Ok(DispatchResult::applied(created.id, None, RequestStatus::Submitted))
    }

    /// Validate a vote. It is persisted by the status compare-and-set, so a
    /// request finalized in the meantime never gains it.
    async fn prepare_vote(
        &self,
        scope: &TenantScope,
        invocation: &WorkflowInvocation,
        request: &ReviewRequest,
        payload: &CastVotePayload,
    ) -> StewardResult<CommitteeVote> {
        let committee = self.load_committee(scope, request).await?;
        if !committee.is_member(&invocation.actor.id) {
            return Err(StewardError::NotACommitteeMember {
                actor: invocation.actor.id.clone(),
                committee: committee.committee_id,
            });
        }

        let now = Utc::now();
        if payload.expires_at.is_some_and(|t| t <= now) {
            return Err(StewardError::InvalidPayload("vote expiry is in the past".to_string()));
        }

        let mut vote = CommitteeVote::new(
            request.id.clone(),
            request.round,
            invocation.actor.id.clone(),
            payload.vote,
        )
        .at(now);
        vote.notes = payload.notes.clone();
        vote.conditions = payload.conditions.clone();
        vote.expires_at = payload.expires_at;

        debug!(
            request_id = %request.id,
            reviewer_id = %invocation.actor.id,
            vote = %payload.vote,
            round = request.round,
            "vote prepared"
        );
        Ok(vote)
    }

    /// Consult the decision engine before a terminal write. Nothing is
    /// persisted when the policy rejects the decision.
    async fn check_decision(
        &self,
        scope: &TenantScope,
        invocation: &WorkflowInvocation,
        request: &ReviewRequest,
        payload: &RecordDecisionPayload,
    ) -> StewardResult<()> {
        let committee = self.load_committee(scope, request).await?;
        if !invocation.actor.privileged && !committee.is_member(&invocation.actor.id) {
            return Err(StewardError::NotACommitteeMember {
                actor: invocation.actor.id.clone(),
                committee: committee.committee_id,
            });
        }

        let votes = self.storage.votes(scope, &request.id, request.round).await?;
        self.decisions
            .evaluate(payload.decision, &votes, &committee.config)?;
        Ok(())
    }

    async fn journal_notice(
        &self,
        scope: &TenantScope,
        request: &ReviewRequest,
        status: RequestStatus,
        transition_key: &str,
    ) -> StewardResult<()> {
        let notice = Notice::for_request(request, NoticeKind::for_status(status), transition_key);
        if !self.storage.enqueue_notice(scope, notice).await? {
            debug!(request_id = %request.id, status = %status, "notice already journaled");
        }
        Ok(())
    }

    async fn load_request(&self, scope: &TenantScope, id: &RequestId) -> StewardResult<ReviewRequest> {
        self.storage
            .get_request(scope, id)
            .await?
            .ok_or_else(|| StewardError::RequestNotFound(id.clone()))
    }

    async fn load_committee(&self, scope: &TenantScope, request: &ReviewRequest) -> StewardResult<Committee> {
        self.storage
            .get_committee(scope, &request.committee_id)
            .await?
            .ok_or_else(|| StewardError::CommitteeNotFound(request.committee_id.clone()))
    }
}
