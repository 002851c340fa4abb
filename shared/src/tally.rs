use std::collections::HashSet;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::identity::VoterIdentity;
use crate::models::*;
use crate::validation::{validate_poll_request, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TallyError {
    #[error("Identity has already voted on this poll")]
    AlreadyVoted,
    #[error("Option index {index} out of range for {len} options")]
    OptionOutOfRange { index: usize, len: usize },
    #[error("Poll creator cannot vote")]
    CreatorVote,
    #[error("Tally mismatch: total {total}, option sum {option_sum}, voters {voters}")]
    CountMismatch { total: u64, option_sum: u64, voters: usize },
    #[error("Option {index} count {count} disagrees with {recorded} recorded voters")]
    OptionMismatch { index: usize, count: u64, recorded: u64 },
    #[error("Duplicate voter identity {0}")]
    DuplicateVoter(String),
}

impl Poll {
    /// Builds a fresh poll with zeroed counts. Option texts and the question are stored trimmed.
    pub fn create(creator: VoterIdentity, request: &CreatePollRequest) -> Result<Poll, ValidationError> {
        validate_poll_request(request)?;

        Ok(Poll {
            id: Uuid::new_v4(),
            question: request.question.trim().to_string(),
            options: request.options.iter()
                .map(|opt| PollOption { text: opt.text.trim().to_string(), count: 0 })
                .collect(),
            creator,
            is_public: request.is_public.unwrap_or(true),
            total_votes: 0,
            voters: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    /// Applies one vote, or nothing at all.
    ///
    /// Every check happens before the first write, so an `Err` leaves the poll
    /// untouched. Callers must hold exclusive access to the poll for the whole call.
    pub fn record_vote(&mut self, vote: VoterRecord) -> Result<(), TallyError> {
        if self.is_creator(&vote.identity) {
            return Err(TallyError::CreatorVote);
        }
        if vote.option_index >= self.options.len() {
            return Err(TallyError::OptionOutOfRange {
                index: vote.option_index,
                len: self.options.len(),
            });
        }
        if self.has_voted(&vote.identity) {
            return Err(TallyError::AlreadyVoted);
        }

        self.options[vote.option_index].count += 1;
        self.total_votes += 1;
        self.voters.push(vote);
        Ok(())
    }

    /// Confirms the stored counters agree with the stored voter set.
    pub fn check_tally(&self) -> Result<(), TallyError> {
        let option_sum: u64 = self.options.iter().map(|o| o.count).sum();
        if self.total_votes != option_sum || self.total_votes != self.voters.len() as u64 {
            return Err(TallyError::CountMismatch {
                total: self.total_votes,
                option_sum,
                voters: self.voters.len(),
            });
        }

        let mut recorded = vec![0u64; self.options.len()];
        let mut seen = HashSet::with_capacity(self.voters.len());
        for voter in &self.voters {
            if voter.option_index >= self.options.len() {
                return Err(TallyError::OptionOutOfRange {
                    index: voter.option_index,
                    len: self.options.len(),
                });
            }
            if self.is_creator(&voter.identity) {
                return Err(TallyError::CreatorVote);
            }
            if !seen.insert(&voter.identity) {
                return Err(TallyError::DuplicateVoter(voter.identity.key()));
            }
            recorded[voter.option_index] += 1;
        }

        for (index, (option, recorded)) in self.options.iter().zip(recorded).enumerate() {
            if option.count != recorded {
                return Err(TallyError::OptionMismatch { index, count: option.count, recorded });
            }
        }

        Ok(())
    }

    pub fn public_aggregate(&self) -> PublicAggregate {
        PublicAggregate {
            id: self.id,
            question: self.question.clone(),
            options: self.options.iter()
                .map(|o| OptionTally { text: o.text.clone(), count: o.count })
                .collect(),
            total_votes: self.total_votes,
            is_public: self.is_public,
            created_at: self.created_at,
        }
    }

    pub fn voter_breakdown(&self) -> VoterBreakdown {
        let mut options: Vec<OptionVoters> = self.options.iter()
            .map(|o| OptionVoters { text: o.text.clone(), voters: Vec::new() })
            .collect();

        for voter in &self.voters {
            if let Some(option) = options.get_mut(voter.option_index) {
                option.voters.push(voter.display_name.clone());
            }
        }

        VoterBreakdown {
            id: self.id,
            question: self.question.clone(),
            options,
            total_votes: self.total_votes,
        }
    }
}
