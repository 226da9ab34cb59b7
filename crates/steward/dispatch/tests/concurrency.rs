//! Exactly-once execution under concurrent duplicates, and race-to-finalize.

mod common;

use common::*;
use futures::future::join_all;
use steward_storage::{CommitteeStore, NoticeOutbox, RequestStore};
use steward_types::{ErrorKind, NoticeKind, RequestStatus, VoteAction};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_create_exactly_once() {
    let fx = Fixture::new().await;

    let handles = (0..10).map(|_| {
        let dispatcher = fx.dispatcher.clone();
        tokio::spawn(async move {
            let invocation = steward_types::WorkflowInvocation::new(
                create_action("Solar panels"),
                org_a(),
                alice(),
                "create-once",
            );
            dispatcher.dispatch(invocation).await
        })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(results.iter().all(|r| r.success), "{results:?}");
    let first = &results[0];
    assert!(results.iter().all(|r| r == first));

    let id = first.entity_id.clone().unwrap();
    let request = fx
        .storage
        .find_by_creation_key(&admin_scope(), "create-once")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.id, id);

    let submitted = fx
        .storage
        .pending_notices(&admin_scope())
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NoticeKind::Submitted)
        .count();
    assert_eq!(submitted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_votes_append_once() {
    let fx = Fixture::new().await;
    let id = fx.under_review("req-v").await;

    let handles = (0..8).map(|_| {
        let dispatcher = fx.dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let invocation = steward_types::WorkflowInvocation::new(
                vote_action(VoteAction::Approve),
                org_a(),
                reviewer("r1"),
                "vote-once",
            )
            .on_entity(id);
            dispatcher.dispatch(invocation).await
        })
    });
    for result in join_all(handles).await {
        assert!(result.unwrap().success);
    }

    let votes = fx.storage.votes(&admin_scope(), &id, 1).await.unwrap();
    assert_eq!(votes.len(), 1);
    let request = fx.request(&id).await;
    assert_eq!(
        request.history.iter().filter(|t| t.idempotency_key == "vote-once").count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn race_to_finalize_has_exactly_one_winner() {
    for round in 0..5 {
        let fx = Fixture::new().await;
        let id = fx.under_review(&format!("req-race-{round}")).await;
        for (i, name) in ["r1", "r2", "r3"].iter().enumerate() {
            assert!(fx.vote(name, &id, VoteAction::Approve, &format!("v{i}")).await.success);
        }
        assert!(fx.vote("r4", &id, VoteAction::Deny, "v3").await.success);

        let approve = {
            let dispatcher = fx.dispatcher.clone();
            let invocation = steward_types::WorkflowInvocation::new(
                decision_action(VoteAction::Approve),
                org_a(),
                reviewer("r1"),
                "finalize-approve",
            )
            .on_entity(id.clone());
            tokio::spawn(async move { dispatcher.dispatch(invocation).await })
        };
        let deny = {
            let dispatcher = fx.dispatcher.clone();
            let invocation = steward_types::WorkflowInvocation::new(
                decision_action(VoteAction::Deny),
                org_a(),
                reviewer("r4"),
                "finalize-deny",
            )
            .on_entity(id.clone());
            tokio::spawn(async move { dispatcher.dispatch(invocation).await })
        };

        let approve = approve.await.unwrap();
        let deny = deny.await.unwrap();
        assert!(
            approve.success ^ deny.success,
            "exactly one finalizer must win: {approve:?} / {deny:?}"
        );

        let (winner, loser) = if approve.success {
            (approve, deny)
        } else {
            (deny, approve)
        };
        assert_eq!(loser.error_kind, Some(ErrorKind::BadRequest));
        assert!(loser.error.as_deref().unwrap_or_default().contains("already finalized"));

        let persisted = fx.request(&id).await;
        assert_eq!(Some(persisted.status), winner.new_status);
        assert!(matches!(
            persisted.status,
            RequestStatus::Approved | RequestStatus::Denied
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_contend() {
    let fx = Fixture::new().await;

    let handles = (0..6).map(|i| {
        let dispatcher = fx.dispatcher.clone();
        tokio::spawn(async move {
            let invocation = steward_types::WorkflowInvocation::new(
                create_action(&format!("Request {i}")),
                org_a(),
                alice(),
                format!("create-{i}"),
            );
            dispatcher.dispatch(invocation).await
        })
    });
    let ids: std::collections::HashSet<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().entity_id.unwrap())
        .collect();
    assert_eq!(ids.len(), 6);
}
