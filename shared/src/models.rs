use serde::{Serialize, Deserialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::identity::VoterIdentity;

/// A single-choice poll together with its running tally.
///
/// `total_votes` and every `PollOption::count` are stored alongside the
/// voter records rather than recomputed. They only ever change through
/// `Poll::record_vote`, which keeps them in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<PollOption>,
    pub creator: VoterIdentity,
    pub is_public: bool,
    pub total_votes: u64,
    pub voters: Vec<VoterRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub text: String,
    pub count: u64,
}

/// One counted vote. At most one exists per identity and poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoterRecord {
    pub identity: VoterIdentity,
    pub option_index: usize,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub voted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionDraft {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<OptionDraft>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// Raw vote submission. Both fields are optional on the wire so that a
/// missing value is reported as a validation error instead of a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitVoteRequest {
    #[serde(default)]
    pub option_index: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptionTally {
    pub text: String,
    pub count: u64,
}

/// Counts-only view, safe to show to anyone who may see the poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicAggregate {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<OptionTally>,
    pub total_votes: u64,
    pub is_public: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptionVoters {
    pub text: String,
    pub voters: Vec<String>,
}

/// Owner-only view: which display names picked which option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoterBreakdown {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<OptionVoters>,
    pub total_votes: u64,
}

/// Payload pushed to realtime subscribers after every committed vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdate {
    pub poll: PublicAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub message: String,
    pub poll: PublicAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollEnvelope {
    pub poll: PublicAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollList {
    pub polls: Vec<PublicAggregate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownEnvelope {
    pub breakdown: VoterBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
    pub message: String,
}

impl Poll {
    pub fn has_voted(&self, identity: &VoterIdentity) -> bool {
        self.voters.iter().any(|v| &v.identity == identity)
    }

    pub fn is_creator(&self, identity: &VoterIdentity) -> bool {
        &self.creator == identity
    }

    /// Public polls are visible to everyone, private ones only to their creator.
    pub fn is_visible_to(&self, identity: Option<&VoterIdentity>) -> bool {
        self.is_public || identity.is_some_and(|id| self.is_creator(id))
    }
}
