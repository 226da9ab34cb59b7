//! Finalization policy

use crate::VoteTally;
use chrono::{DateTime, Utc};
use steward_types::{CommitteeConfig, CommitteeVote, StewardError, StewardResult, VoteAction};
use tracing::{debug, warn};

/// Check whether `action` may finalize a request given the current votes.
pub fn evaluate_finalization(
    action: VoteAction,
    votes: &[CommitteeVote],
    config: &CommitteeConfig,
) -> StewardResult<()> {
    evaluate_finalization_at(action, votes, config, Utc::now()).map(|_| ())
}

/// As [`evaluate_finalization`], with an explicit clock for vote expiry.
/// Returns the tally the decision was based on.
pub fn evaluate_finalization_at(
    action: VoteAction,
    votes: &[CommitteeVote],
    config: &CommitteeConfig,
    now: DateTime<Utc>,
) -> StewardResult<VoteTally> {
    let tally = VoteTally::from_votes(votes, now);

    if let Some(quorum) = config.quorum {
        if tally.counted < quorum {
            return Err(StewardError::QuorumNotMet {
                required: quorum,
                current: tally.counted,
            });
        }
    }

    // Only approvals carry a threshold; a denial needs nothing beyond quorum.
    if action == VoteAction::Approve {
        if let Some(threshold) = config.approval_threshold_percent {
            let actual = tally.approval_percent(config);
            if actual < threshold {
                return Err(StewardError::ThresholdNotMet {
                    required: threshold,
                    actual,
                });
            }
        }
    }

    Ok(tally)
}

/// Evaluates committee policy and logs the outcome
#[derive(Clone, Debug, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Tally votes at the current time
    pub fn tally(&self, votes: &[CommitteeVote]) -> VoteTally {
        VoteTally::from_votes(votes, Utc::now())
    }

    /// Evaluate a finalizing action, returning the tally it was based on
    pub fn evaluate(
        &self,
        action: VoteAction,
        votes: &[CommitteeVote],
        config: &CommitteeConfig,
    ) -> StewardResult<VoteTally> {
        match evaluate_finalization_at(action, votes, config, Utc::now()) {
            Ok(tally) => {
                debug!(
                    decision = %action,
                    counted = tally.counted,
                    approve = tally.approve,
                    approval_percent = tally.approval_percent(config),
                    "Finalization permitted"
                );
                Ok(tally)
            }
            Err(e) => {
                warn!(decision = %action, error = %e, "Finalization blocked by committee policy");
                Err(e)
            }
        }
    }
}
