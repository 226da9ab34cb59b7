//! Vote tallying

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use steward_types::{ActorId, CommitteeConfig, CommitteeVote, VoteAction};

/// Counted votes for one request round
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub approve: u32,
    pub deny: u32,
    pub request_changes: u32,
    pub table: u32,
    /// Latest votes excluded because they had expired
    pub expired: u32,
    /// Reviewers whose latest vote counts
    pub counted: u32,
}

impl VoteTally {
    /// Tally `votes`, keeping each reviewer's latest vote and dropping it if
    /// it has expired at `now`.
    pub fn from_votes(votes: &[CommitteeVote], now: DateTime<Utc>) -> Self {
        let mut latest: HashMap<&ActorId, (usize, &CommitteeVote)> = HashMap::new();
        for (position, vote) in votes.iter().enumerate() {
            let replace = match latest.get(&vote.reviewer_id) {
                Some((seen_at, seen)) => (vote.created_at, position) >= (seen.created_at, *seen_at),
                None => true,
            };
            if replace {
                latest.insert(&vote.reviewer_id, (position, vote));
            }
        }

        let mut tally = VoteTally::default();
        for (_, vote) in latest.into_values() {
            if vote.is_expired(now) {
                tally.expired += 1;
                continue;
            }
            tally.counted += 1;
            match vote.action {
                VoteAction::Approve => tally.approve += 1,
                VoteAction::Deny => tally.deny += 1,
                VoteAction::RequestChanges => tally.request_changes += 1,
                VoteAction::Table => tally.table += 1,
            }
        }
        tally
    }

    pub fn count(&self, action: VoteAction) -> u32 {
        match action {
            VoteAction::Approve => self.approve,
            VoteAction::Deny => self.deny,
            VoteAction::RequestChanges => self.request_changes,
            VoteAction::Table => self.table,
        }
    }

    /// Approvals as a percentage of active members; 0 with no active members
    pub fn approval_percent(&self, config: &CommitteeConfig) -> f64 {
        if config.active_member_count == 0 {
            return 0.0;
        }
        self.approve as f64 / config.active_member_count as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use steward_types::RequestId;

    fn vote(reviewer: &str, action: VoteAction) -> CommitteeVote {
        CommitteeVote::new(RequestId::new("r1"), 1, ActorId::new(reviewer), action)
    }

    #[test]
    fn test_last_vote_wins() {
        let now = Utc::now();
        let votes = vec![
            vote("a", VoteAction::Deny).at(now - Duration::minutes(2)),
            vote("b", VoteAction::Approve).at(now - Duration::minutes(2)),
            vote("a", VoteAction::Approve).at(now - Duration::minutes(1)),
        ];
        let tally = VoteTally::from_votes(&votes, now);
        assert_eq!(tally.counted, 2);
        assert_eq!(tally.approve, 2);
        assert_eq!(tally.deny, 0);
    }

    #[test]
    fn test_same_timestamp_later_position_wins() {
        let now = Utc::now();
        let votes = vec![
            vote("a", VoteAction::Deny).at(now),
            vote("a", VoteAction::Table).at(now),
        ];
        let tally = VoteTally::from_votes(&votes, now);
        assert_eq!(tally.table, 1);
        assert_eq!(tally.deny, 0);
    }

    #[test]
    fn test_expired_latest_vote_is_excluded() {
        let now = Utc::now();
        let votes = vec![
            vote("a", VoteAction::Approve).at(now - Duration::minutes(3)),
            vote("a", VoteAction::Approve)
                .at(now - Duration::minutes(2))
                .expiring_at(now - Duration::minutes(1)),
            vote("b", VoteAction::Approve).expiring_at(now + Duration::hours(1)),
        ];
        let tally = VoteTally::from_votes(&votes, now);
        assert_eq!(tally.counted, 1);
        assert_eq!(tally.expired, 1);
    }

    #[test]
    fn test_approval_percent_zero_members() {
        let tally = VoteTally {
            approve: 3,
            counted: 3,
            ..Default::default()
        };
        assert_eq!(tally.approval_percent(&CommitteeConfig::new(0)), 0.0);
        assert_eq!(tally.approval_percent(&CommitteeConfig::new(4)), 75.0);
    }
}
