use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tracing::{debug, warn};
use uuid::Uuid;
use shared::PollUpdate;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

type Channels = RwLock<HashMap<Uuid, broadcast::Sender<PollUpdate>>>;

/// Per-poll broadcast topics for live result updates.
///
/// Channels are created on first subscription and dropped together with their
/// last `Subscription`. Delivery is best-effort: a subscriber that falls more than
/// `capacity` updates behind skips ahead, and nothing is replayed to late joiners.
#[derive(Debug)]
pub struct Publisher {
    channels: Arc<Channels>,
    capacity: usize,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A live receiver on one poll's channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    poll_id: Uuid,
    receiver: broadcast::Receiver<PollUpdate>,
    channels: Weak<Channels>,
}

impl Subscription {
    /// Waits for the next update. Returns `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<PollUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(poll_id = %self.poll_id, skipped, "Subscriber lagged, skipping updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for an already delivered update.
    pub fn try_next(&mut self) -> Option<PollUpdate> {
        loop {
            match self.receiver.try_recv() {
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else { return };
        let mut channels = channels.write().unwrap_or_else(PoisonError::into_inner);
        // Our receiver is still counted here; subscribe() only adds receivers under this lock.
        if channels.get(&self.poll_id).is_some_and(|s| s.receiver_count() <= 1) {
            channels.remove(&self.poll_id);
            debug!(poll_id = %self.poll_id, "Last subscriber left, channel closed");
        }
    }
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, poll_id: Uuid) -> Subscription {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(poll_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        debug!(%poll_id, subscribers = sender.receiver_count() + 1, "Subscriber joined");

        Subscription {
            poll_id,
            receiver: sender.subscribe(),
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Emits one update on the poll's channel and returns how many receivers got it.
    pub fn publish(&self, update: PollUpdate) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        match channels.get(&update.poll.id) {
            Some(sender) => sender.send(update).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, poll_id: Uuid) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(&poll_id).map_or(0, |s| s.receiver_count())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
