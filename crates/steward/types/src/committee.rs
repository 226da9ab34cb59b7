//! Committees, votes, and decision policy configuration

use crate::{ActorId, AssociationId, CommitteeId, OrganizationId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A reviewer's position on a request, also used as a finalizing decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteAction {
    Approve,
    Deny,
    RequestChanges,
    Table,
}

impl VoteAction {
    pub const ALL: [VoteAction; 4] = [
        VoteAction::Approve,
        VoteAction::Deny,
        VoteAction::RequestChanges,
        VoteAction::Table,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteAction::Approve => "APPROVE",
            VoteAction::Deny => "DENY",
            VoteAction::RequestChanges => "REQUEST_CHANGES",
            VoteAction::Table => "TABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for VoteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reviewer vote. Append-only; the latest vote per reviewer counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitteeVote {
    pub request_id: RequestId,
    /// Review round the vote was cast in
    pub round: u32,
    pub reviewer_id: ActorId,
    pub action: VoteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CommitteeVote {
    pub fn new(request_id: RequestId, round: u32, reviewer_id: ActorId, action: VoteAction) -> Self {
        Self {
            request_id,
            round,
            reviewer_id,
            action,
            notes: None,
            conditions: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_conditions(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Decision policy for a committee
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitteeConfig {
    /// Minimum number of counted votes before any decision can be recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,
    /// Minimum percentage of active members approving, for APPROVE only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_threshold_percent: Option<f64>,
    pub active_member_count: u32,
}

impl CommitteeConfig {
    pub fn new(active_member_count: u32) -> Self {
        Self {
            quorum: None,
            approval_threshold_percent: None,
            active_member_count,
        }
    }

    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_threshold(mut self, percent: f64) -> Self {
        self.approval_threshold_percent = Some(percent);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Committee {
    pub committee_id: CommitteeId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<AssociationId>,
    pub members: BTreeSet<ActorId>,
    pub config: CommitteeConfig,
}

impl Committee {
    /// A committee whose active member count is its roster size
    pub fn new(
        committee_id: CommitteeId,
        organization_id: OrganizationId,
        members: impl IntoIterator<Item = ActorId>,
    ) -> Self {
        let members: BTreeSet<ActorId> = members.into_iter().collect();
        let config = CommitteeConfig::new(members.len() as u32);
        Self {
            committee_id,
            organization_id,
            association_id: None,
            members,
            config,
        }
    }

    pub fn in_association(mut self, association_id: AssociationId) -> Self {
        self.association_id = Some(association_id);
        self
    }

    pub fn with_config(mut self, config: CommitteeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_member(&self, actor: &ActorId) -> bool {
        self.members.contains(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_vote_action_parse() {
        for action in VoteAction::ALL {
            assert_eq!(VoteAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(VoteAction::parse("ABSTAIN"), None);
    }

    #[test]
    fn test_vote_expiry() {
        let now = Utc::now();
        let vote = CommitteeVote::new(RequestId::new("r"), 1, ActorId::new("a"), VoteAction::Approve);
        assert!(!vote.is_expired(now));
        let vote = vote.expiring_at(now - Duration::minutes(1));
        assert!(vote.is_expired(now));
    }

    #[test]
    fn test_committee_membership() {
        let c = Committee::new(
            CommitteeId::new("arc"),
            OrganizationId::new("org"),
            [ActorId::new("a"), ActorId::new("b")],
        );
        assert_eq!(c.config.active_member_count, 2);
        assert!(c.is_member(&ActorId::new("a")));
        assert!(!c.is_member(&ActorId::new("z")));
    }
}
