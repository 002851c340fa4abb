use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;
use shared::{models::*, TallyError, VoterIdentity};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Poll not found")]
    NotFound,
    #[error("Identity has already voted")]
    AlreadyVoted,
    #[error("Option index out of range")]
    OptionOutOfRange,
    #[error("Poll creator cannot vote")]
    CreatorVote,
    #[error("Store lock poisoned")]
    LockFailed,
    #[error("Database error: {0}")]
    Database(String),
}

impl From<TallyError> for StoreError {
    fn from(e: TallyError) -> Self {
        match e {
            TallyError::AlreadyVoted => StoreError::AlreadyVoted,
            TallyError::OptionOutOfRange { .. } => StoreError::OptionOutOfRange,
            TallyError::CreatorVote => StoreError::CreatorVote,
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Persistence for poll aggregates.
///
/// `commit_vote` is the only mutation after creation. Implementations must make
/// it a single conditional step: either the identity is absent and the vote is
/// appended with both counters incremented, or nothing changes. Two concurrent
/// calls for the same identity must never both succeed.
#[rocket::async_trait]
pub trait PollStore: Send + Sync {
    async fn insert(&self, poll: Poll) -> Result<(), StoreError>;

    async fn fetch(&self, id: Uuid) -> Result<Option<Poll>, StoreError>;

    /// Polls owned by `creator`, newest first.
    async fn list_by_creator(&self, creator: &VoterIdentity) -> Result<Vec<Poll>, StoreError>;

    /// Returns the poll as it stands right after this vote was applied.
    async fn commit_vote(&self, id: Uuid, vote: VoterRecord) -> Result<Poll, StoreError>;
}

/// Process-local store. Each poll sits behind its own mutex, so commits on
/// different polls never contend; the outer map lock is held only for lookups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    polls: RwLock<HashMap<Uuid, Arc<Mutex<Poll>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: Uuid) -> Result<Option<Arc<Mutex<Poll>>>, StoreError> {
        let polls = self.polls.read().map_err(|_| StoreError::LockFailed)?;
        Ok(polls.get(&id).cloned())
    }
}

#[rocket::async_trait]
impl PollStore for MemoryStore {
    async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
        let mut polls = self.polls.write().map_err(|_| StoreError::LockFailed)?;
        polls.insert(poll.id, Arc::new(Mutex::new(poll)));
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        let Some(entry) = self.entry(id)? else { return Ok(None) };
        let poll = entry.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(Some(poll.clone()))
    }

    async fn list_by_creator(&self, creator: &VoterIdentity) -> Result<Vec<Poll>, StoreError> {
        let entries: Vec<_> = {
            let polls = self.polls.read().map_err(|_| StoreError::LockFailed)?;
            polls.values().cloned().collect()
        };

        let mut owned = Vec::new();
        for entry in entries {
            let poll = entry.lock().map_err(|_| StoreError::LockFailed)?;
            if poll.is_creator(creator) {
                owned.push(poll.clone());
            }
        }
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn commit_vote(&self, id: Uuid, vote: VoterRecord) -> Result<Poll, StoreError> {
        let entry = self.entry(id)?.ok_or(StoreError::NotFound)?;
        // No await while the guard is held: check and write happen in one critical section.
        let mut poll = entry.lock().map_err(|_| StoreError::LockFailed)?;
        poll.record_vote(vote)?;
        Ok(poll.clone())
    }
}
