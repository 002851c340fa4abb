use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use shared::{models::*, validate_vote_request, ValidationError, VoterIdentity};
use crate::publisher::{Publisher, Subscription};
use crate::store::{PollStore, StoreError};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Poll not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("Authentication required")]
    Unauthenticated,
    #[error("You have already voted on this poll")]
    AlreadyVoted,
    #[error("Invalid option index")]
    InvalidOption,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for VoteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => VoteError::NotFound,
            StoreError::AlreadyVoted => VoteError::AlreadyVoted,
            StoreError::OptionOutOfRange => VoteError::InvalidOption,
            StoreError::CreatorVote => VoteError::Forbidden(OWNER_CANNOT_VOTE),
            StoreError::LockFailed | StoreError::Database(_) => VoteError::Internal(e.to_string()),
        }
    }
}

const ACCESS_DENIED: &str = "Access denied";
const OWNER_CANNOT_VOTE: &str = "Owners cannot vote on their own poll";
const OWNER_ONLY: &str = "Only the poll owner can view voters";

type Lane = Arc<tokio::sync::Mutex<()>>;

/// Per-poll async locks ordering commit + publish within this process, so that
/// broadcasts on one channel follow commit order. Polls never share a lane, and a
/// lane only exists while some commit on its poll is queued or running.
#[derive(Debug, Default)]
struct CommitLanes {
    lanes: Mutex<HashMap<Uuid, Lane>>,
}

impl CommitLanes {
    fn acquire(&self, poll_id: Uuid) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry(poll_id).or_default())
    }

    /// Hands back a lane taken with `acquire`. The entry is removed once the map
    /// holds the last other reference. Clones are only made under the map lock,
    /// so the count cannot grow while it is checked.
    fn release(&self, poll_id: Uuid, lane: Lane) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lane) == 2 && lanes.get(&poll_id).is_some_and(|l| Arc::ptr_eq(l, &lane)) {
            lanes.remove(&poll_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Entry point for every poll operation: creation, the atomic vote commit,
/// both read views, and realtime subscriptions.
pub struct VoteProcessor {
    store: Arc<dyn PollStore>,
    publisher: Arc<Publisher>,
    store_timeout: Duration,
    lanes: Arc<CommitLanes>,
}

impl VoteProcessor {
    pub fn new(store: Arc<dyn PollStore>, publisher: Arc<Publisher>, store_timeout: Duration) -> Self {
        Self {
            store,
            publisher,
            store_timeout,
            lanes: Arc::default(),
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, VoteError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match timeout(self.store_timeout, op).await {
            Ok(result) => result.map_err(VoteError::from),
            Err(_) => {
                error!("Storage call exceeded {:?}", self.store_timeout);
                Err(VoteError::Internal("storage timed out".into()))
            }
        }
    }

    async fn load(&self, poll_id: Uuid) -> Result<Poll, VoteError> {
        self.bounded(self.store.fetch(poll_id)).await?.ok_or(VoteError::NotFound)
    }

    pub async fn create_poll(&self, caller: &VoterIdentity, request: &CreatePollRequest) -> Result<PublicAggregate, VoteError> {
        if !caller.is_authenticated() {
            return Err(VoteError::Unauthenticated);
        }

        let poll = Poll::create(caller.clone(), request)?;
        let aggregate = poll.public_aggregate();
        self.bounded(self.store.insert(poll)).await?;

        info!(poll_id = %aggregate.id, options = aggregate.options.len(), "Poll created");
        Ok(aggregate)
    }

    pub async fn list_polls(&self, caller: &VoterIdentity) -> Result<Vec<PublicAggregate>, VoteError> {
        if !caller.is_authenticated() {
            return Err(VoteError::Unauthenticated);
        }

        let polls = self.bounded(self.store.list_by_creator(caller)).await?;
        Ok(polls.iter().map(Poll::public_aggregate).collect())
    }

    /// Validates, then commits a single vote atomically and broadcasts the result.
    ///
    /// The checks before the commit read a snapshot that may already be stale;
    /// the store's conditional mutation is what actually decides AlreadyVoted.
    /// Commit and publish run in a spawned task, so dropping this future after
    /// the commit has started neither undoes it nor loses its broadcast.
    pub async fn submit_vote(
        &self,
        poll_id: Uuid,
        request: &SubmitVoteRequest,
        caller: &VoterIdentity,
    ) -> Result<PublicAggregate, VoteError> {
        let input = validate_vote_request(request)?;

        let poll = self.load(poll_id).await?;
        if !poll.is_visible_to(Some(caller)) {
            return Err(VoteError::Forbidden(ACCESS_DENIED));
        }
        if poll.is_creator(caller) {
            return Err(VoteError::Forbidden(OWNER_CANNOT_VOTE));
        }
        let option_index = usize::try_from(input.option_index)
            .ok()
            .filter(|&i| i < poll.options.len())
            .ok_or(VoteError::InvalidOption)?;

        let vote = VoterRecord {
            identity: caller.clone(),
            option_index,
            display_name: input.display_name,
            voted_at: OffsetDateTime::now_utc(),
        };

        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let lanes = Arc::clone(&self.lanes);
        let lane = lanes.acquire(poll_id);
        let store_timeout = self.store_timeout;

        let commit = tokio::spawn(async move {
            let outcome = {
                let _turn = lane.lock().await;
                commit_and_publish(store.as_ref(), &publisher, store_timeout, poll_id, vote).await
            };
            lanes.release(poll_id, lane);
            outcome
        });

        let result = commit.await.map_err(|e| VoteError::Internal(e.to_string()))?;
        if let Err(ref e) = result {
            debug!(%poll_id, "Vote rejected: {}", e);
        }
        result
    }

    pub async fn public_aggregate(&self, poll_id: Uuid, caller: Option<&VoterIdentity>) -> Result<PublicAggregate, VoteError> {
        let poll = self.load(poll_id).await?;
        if !poll.is_visible_to(caller) {
            return Err(VoteError::Forbidden(ACCESS_DENIED));
        }
        Self::verify(&poll)?;
        Ok(poll.public_aggregate())
    }

    pub async fn voter_breakdown(&self, poll_id: Uuid, caller: &VoterIdentity) -> Result<VoterBreakdown, VoteError> {
        let poll = self.load(poll_id).await?;
        if !poll.is_creator(caller) {
            return Err(VoteError::Forbidden(OWNER_ONLY));
        }
        Self::verify(&poll)?;
        Ok(poll.voter_breakdown())
    }

    /// Joins a poll's update channel after the same visibility check as the public view.
    pub async fn subscribe(&self, poll_id: Uuid, caller: Option<&VoterIdentity>) -> Result<Subscription, VoteError> {
        self.public_aggregate(poll_id, caller).await?;
        Ok(self.publisher.subscribe(poll_id))
    }

    /// Polls with a commit currently queued or in flight.
    #[cfg(test)]
    pub(crate) fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    fn verify(poll: &Poll) -> Result<(), VoteError> {
        poll.check_tally().map_err(|e| {
            error!(poll_id = %poll.id, "Stored tally is inconsistent: {}", e);
            VoteError::Internal(e.to_string())
        })
    }
}

/// Runs inside the poll's lane. A timed-out commit may still have landed in
/// storage; if the re-read shows the vote, it is broadcast so subscribers stay
/// in step with the stored tally, and the caller still sees Internal.
async fn commit_and_publish(
    store: &dyn PollStore,
    publisher: &Publisher,
    store_timeout: Duration,
    poll_id: Uuid,
    vote: VoterRecord,
) -> Result<PublicAggregate, VoteError> {
    let identity = vote.identity.clone();

    let committed = match timeout(store_timeout, store.commit_vote(poll_id, vote)).await {
        Ok(result) => result?,
        Err(_) => {
            error!(%poll_id, "Vote commit exceeded {:?}", store_timeout);
            if let Ok(Ok(Some(poll))) = timeout(store_timeout, store.fetch(poll_id)).await {
                if poll.has_voted(&identity) {
                    warn!(%poll_id, "Timed-out commit was applied, publishing it");
                    publisher.publish(PollUpdate { poll: poll.public_aggregate() });
                }
            }
            return Err(VoteError::Internal("storage timed out".into()));
        }
    };

    let aggregate = committed.public_aggregate();
    let delivered = publisher.publish(PollUpdate { poll: aggregate.clone() });
    debug!(%poll_id, total_votes = aggregate.total_votes, delivered, "Vote committed");
    Ok(aggregate)
}
