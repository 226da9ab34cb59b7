//! Review request lifecycle

use steward_types::{ActionKind, RequestStatus, StewardError, StewardResult, VoteAction, WorkflowAction};

/// Legal transitions for review requests.
pub struct ReviewStateMachine;

impl ReviewStateMachine {
    /// Statuses from which `action` may be applied.
    pub fn legal_from(action: ActionKind) -> &'static [RequestStatus] {
        use RequestStatus::*;

        match action {
            ActionKind::CreateRequest => &[],
            ActionKind::BeginReview => &[Submitted, Tabled],
            ActionKind::CastVote => &[UnderReview],
            ActionKind::RecordDecision => &[UnderReview],
            ActionKind::Resubmit => &[ChangesRequested],
            ActionKind::Withdraw => &[Submitted, UnderReview, ChangesRequested, Tabled],
        }
    }

    /// Status a committee decision moves the request to.
    pub fn decision_target(decision: VoteAction) -> RequestStatus {
        match decision {
            VoteAction::Approve => RequestStatus::Approved,
            VoteAction::Deny => RequestStatus::Denied,
            VoteAction::RequestChanges => RequestStatus::ChangesRequested,
            VoteAction::Table => RequestStatus::Tabled,
        }
    }

    /// Resolve the status `action` moves a request in `from` to.
    ///
    /// Terminal requests accept nothing; a decision on one reports that the
    /// request is already finalized.
    pub fn target(action: &WorkflowAction, from: RequestStatus) -> StewardResult<RequestStatus> {
        let kind = action.kind();
        if from.is_terminal() {
            return Err(match kind {
                ActionKind::RecordDecision => StewardError::AlreadyFinalized(from),
                _ => StewardError::TerminalRequest(from),
            });
        }
        if !Self::legal_from(kind).contains(&from) {
            return Err(StewardError::IllegalTransition {
                action: kind.as_str().to_string(),
                status: from,
            });
        }

        Ok(match action {
            WorkflowAction::CreateRequest(_) => RequestStatus::Submitted,
            WorkflowAction::BeginReview(_) => RequestStatus::UnderReview,
            WorkflowAction::CastVote(_) => RequestStatus::UnderReview,
            WorkflowAction::RecordDecision(p) => Self::decision_target(p.decision),
            WorkflowAction::Resubmit(_) => RequestStatus::Submitted,
            WorkflowAction::Withdraw(_) => RequestStatus::Withdrawn,
        })
    }

    /// Whether applying `kind` starts a new review round
    pub fn starts_round(kind: ActionKind) -> bool {
        matches!(kind, ActionKind::Resubmit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use steward_types::{
        BeginReviewPayload, ErrorKind, RecordDecisionPayload, ResubmitPayload, WithdrawPayload,
    };

    fn decide(decision: VoteAction) -> WorkflowAction {
        WorkflowAction::RecordDecision(RecordDecisionPayload {
            decision,
            notes: None,
        })
    }

    #[test]
    fn test_happy_path() {
        let begin = WorkflowAction::BeginReview(BeginReviewPayload::default());
        assert_eq!(
            ReviewStateMachine::target(&begin, RequestStatus::Submitted).unwrap(),
            RequestStatus::UnderReview
        );
        assert_eq!(
            ReviewStateMachine::target(&decide(VoteAction::Approve), RequestStatus::UnderReview)
                .unwrap(),
            RequestStatus::Approved
        );
        assert_eq!(
            ReviewStateMachine::target(&decide(VoteAction::Table), RequestStatus::UnderReview)
                .unwrap(),
            RequestStatus::Tabled
        );
        assert_eq!(
            ReviewStateMachine::target(&begin, RequestStatus::Tabled).unwrap(),
            RequestStatus::UnderReview
        );
    }

    #[test]
    fn test_illegal_source_status() {
        let resubmit = WorkflowAction::Resubmit(ResubmitPayload::default());
        let err = ReviewStateMachine::target(&resubmit, RequestStatus::UnderReview).unwrap_err();
        assert!(matches!(err, StewardError::IllegalTransition { .. }));
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_terminal_statuses_accept_nothing() {
        let withdraw = WorkflowAction::Withdraw(WithdrawPayload::default());
        for status in RequestStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(matches!(
                ReviewStateMachine::target(&withdraw, status),
                Err(StewardError::TerminalRequest(s)) if s == status
            ));
            assert!(matches!(
                ReviewStateMachine::target(&decide(VoteAction::Deny), status),
                Err(StewardError::AlreadyFinalized(s)) if s == status
            ));
        }
    }

    #[test]
    fn test_no_action_leaves_a_terminal_status() {
        for kind in ActionKind::ALL {
            for from in ReviewStateMachine::legal_from(kind) {
                assert!(!from.is_terminal(), "{kind} legal from terminal {from}");
            }
        }
    }

    fn any_action() -> impl Strategy<Value = WorkflowAction> {
        prop_oneof![
            Just(WorkflowAction::BeginReview(BeginReviewPayload::default())),
            Just(WorkflowAction::Resubmit(ResubmitPayload::default())),
            Just(WorkflowAction::Withdraw(WithdrawPayload::default())),
            (0..VoteAction::ALL.len()).prop_map(|i| decide(VoteAction::ALL[i])),
        ]
    }

    proptest! {
        #[test]
        fn prop_target_only_from_legal_status(
            action in any_action(),
            from in (0..RequestStatus::ALL.len()).prop_map(|i| RequestStatus::ALL[i]),
        ) {
            match ReviewStateMachine::target(&action, from) {
                Ok(to) => {
                    prop_assert!(ReviewStateMachine::legal_from(action.kind()).contains(&from));
                    prop_assert_ne!(to, from);
                }
                Err(e) => prop_assert_eq!(e.kind(), ErrorKind::BadRequest),
            }
        }
    }
}
