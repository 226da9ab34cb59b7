//! Shared fixture: one organization with an association, a four-member
//! architectural committee (quorum 3, 60% approval), a submitter, and a
//! privileged operator homed in another organization.

#![allow(dead_code)]

use std::sync::Arc;
use steward_dispatch::{Dispatcher, StewardConfig};
use steward_idempotency::IdempotencyConfig;
use steward_storage::{CommitteeStore, InMemoryStewardStorage, RequestStore};
use steward_types::{
    Actor, ActorId, AssociationId, BeginReviewPayload, CastVotePayload, Committee, CommitteeConfig,
    CommitteeId, CreateRequestPayload, DispatchResult, OrganizationId, RecordDecisionPayload,
    RequestId, ReviewRequest, TenantContext, TenantScope, VoteAction, WorkflowAction,
    WorkflowInvocation,
};

pub const REVIEWERS: [&str; 4] = ["r1", "r2", "r3", "r4"];

pub fn org_a() -> OrganizationId {
    OrganizationId::new("org-a")
}

pub fn org_b() -> OrganizationId {
    OrganizationId::new("org-b")
}

pub fn north() -> AssociationId {
    AssociationId::new("north")
}

pub fn south() -> AssociationId {
    AssociationId::new("south")
}

pub fn committee_id() -> CommitteeId {
    CommitteeId::new("arc")
}

/// Same roster, owned by the `north` association
pub fn north_committee_id() -> CommitteeId {
    CommitteeId::new("arc-north")
}

pub fn alice() -> Actor {
    Actor::member_of(ActorId::new("alice"), org_a())
}

pub fn mallory() -> Actor {
    Actor::member_of(ActorId::new("mallory"), org_b())
}

pub fn operator() -> Actor {
    Actor::member_of(ActorId::new("ops"), org_b()).privileged()
}

pub fn reviewer(name: &str) -> Actor {
    Actor::member_of(ActorId::new(name), org_a())
}

pub fn fast_config() -> StewardConfig {
    StewardConfig {
        idempotency: IdempotencyConfig {
            wait_timeout_ms: 5_000,
            poll_interval_ms: 10,
            ..IdempotencyConfig::default()
        },
        ..StewardConfig::default()
    }
}

pub struct Fixture {
    pub storage: Arc<InMemoryStewardStorage>,
    pub dispatcher: Arc<Dispatcher<InMemoryStewardStorage>>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: StewardConfig) -> Self {
        let storage = Arc::new(InMemoryStewardStorage::new());
        storage.register_organization(org_a()).unwrap();
        storage.register_organization(org_b()).unwrap();
        storage.register_association(&org_a(), north()).unwrap();
        storage.register_association(&org_a(), south()).unwrap();
        storage.add_member(&org_a(), alice()).unwrap();
        storage.add_member(&org_b(), mallory()).unwrap();
        storage.register_principal(operator()).unwrap();
        for name in REVIEWERS {
            storage.add_member(&org_a(), reviewer(name)).unwrap();
        }

        let committee = Committee::new(
            committee_id(),
            org_a(),
            REVIEWERS.iter().map(|r| ActorId::new(*r)),
        )
        .with_config(CommitteeConfig::new(4).with_quorum(3).with_threshold(60.0));
        storage.put_committee(&admin_scope(), committee.clone()).await.unwrap();

        let mut north_committee = committee.in_association(north());
        north_committee.committee_id = north_committee_id();
        storage.put_committee(&admin_scope(), north_committee).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::with_config(storage.clone(), config));
        Self { storage, dispatcher }
    }

    pub async fn run(
        &self,
        actor: Actor,
        entity: Option<&RequestId>,
        action: WorkflowAction,
        key: &str,
    ) -> DispatchResult {
        let mut invocation = WorkflowInvocation::new(action, org_a(), actor, key);
        if let Some(id) = entity {
            invocation = invocation.on_entity(id.clone());
        }
        self.dispatcher.dispatch(invocation).await
    }

    pub async fn create(&self, key: &str) -> RequestId {
        let result = self.run(alice(), None, create_action("New fence"), key).await;
        assert!(result.success, "create failed: {:?}", result.error);
        result.entity_id.expect("created request id")
    }

    /// A request already under review
    pub async fn under_review(&self, key: &str) -> RequestId {
        let id = self.create(key).await;
        let result = self
            .run(
                alice(),
                Some(&id),
                WorkflowAction::BeginReview(BeginReviewPayload::default()),
                &format!("{key}-begin"),
            )
            .await;
        assert!(result.success, "begin review failed: {:?}", result.error);
        id
    }

    pub async fn vote(&self, name: &str, id: &RequestId, vote: VoteAction, key: &str) -> DispatchResult {
        self.run(reviewer(name), Some(id), vote_action(vote), key).await
    }

    pub async fn decide(&self, name: &str, id: &RequestId, decision: VoteAction, key: &str) -> DispatchResult {
        self.run(reviewer(name), Some(id), decision_action(decision), key).await
    }

    pub async fn request(&self, id: &RequestId) -> ReviewRequest {
        self.storage
            .get_request(&admin_scope(), id)
            .await
            .unwrap()
            .expect("request visible to organization scope")
    }
}

/// Organization-wide scope for inspecting storage directly
pub fn admin_scope() -> TenantScope {
    TenantScope::Active(TenantContext::new(org_a(), alice()))
}

pub fn create_action(title: &str) -> WorkflowAction {
    create_action_for(title, committee_id())
}

pub fn create_action_for(title: &str, committee_id: CommitteeId) -> WorkflowAction {
    WorkflowAction::CreateRequest(CreateRequestPayload {
        title: title.to_string(),
        description: None,
        committee_id,
    })
}

pub fn vote_action(vote: VoteAction) -> WorkflowAction {
    WorkflowAction::CastVote(CastVotePayload {
        vote,
        notes: None,
        conditions: None,
        expires_at: None,
    })
}

pub fn decision_action(decision: VoteAction) -> WorkflowAction {
    WorkflowAction::RecordDecision(RecordDecisionPayload {
        decision,
        notes: None,
    })
}
