#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Once};
    use std::time::Duration;
    use futures::future::join_all;
    use time::OffsetDateTime;
    use uuid::Uuid;
    use shared::{models::*, guest_fingerprint, ValidationError, VoterIdentity};
    use crate::config::AppConfig;
    use crate::processor::{VoteError, VoteProcessor};
    use crate::publisher::Publisher;
    use crate::store::{MemoryStore, PollStore, StoreError};

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    struct Harness {
        store: Arc<MemoryStore>,
        processor: Arc<VoteProcessor>,
        creator: VoterIdentity,
    }

    fn harness() -> Harness {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let processor = VoteProcessor::new(store.clone(), Arc::new(Publisher::new(64)), Duration::from_secs(5));
        Harness {
            store,
            processor: Arc::new(processor),
            creator: user(),
        }
    }

    fn user() -> VoterIdentity {
        VoterIdentity::User(Uuid::new_v4())
    }

    fn guest(token: &str) -> VoterIdentity {
        VoterIdentity::Guest(guest_fingerprint("token", token))
    }

    fn poll_request(options: &[&str], is_public: bool) -> CreatePollRequest {
        CreatePollRequest {
            question: "Where to eat?".into(),
            options: options.iter().map(|t| OptionDraft { text: t.to_string() }).collect(),
            is_public: Some(is_public),
        }
    }

    fn ballot(option_index: i64, name: &str) -> SubmitVoteRequest {
        SubmitVoteRequest {
            option_index: Some(option_index),
            name: Some(name.into()),
        }
    }

    impl Harness {
        async fn create(&self, options: &[&str], is_public: bool) -> Uuid {
            self.processor
                .create_poll(&self.creator, &poll_request(options, is_public))
                .await
                .unwrap()
                .id
        }

        async fn stored(&self, id: Uuid) -> Poll {
            self.store.fetch(id).await.unwrap().unwrap()
        }
    }

    fn assert_consistent(poll: &Poll) {
        let option_sum: u64 = poll.options.iter().map(|o| o.count).sum();
        assert_eq!(poll.total_votes, option_sum);
        assert_eq!(poll.total_votes, poll.voters.len() as u64);
        poll.check_tally().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_store_commit_exactly_once_under_race() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let poll = Poll::create(user(), &poll_request(&["A", "B"], true)).unwrap();
        let id = poll.id;
        store.insert(poll).await.unwrap();

        let voter = guest("same-device");
        let attempts = (0..50).map(|i| {
            let store = Arc::clone(&store);
            let vote = VoterRecord {
                identity: voter.clone(),
                option_index: i % 2,
                display_name: format!("attempt {i}"),
                voted_at: OffsetDateTime::now_utc(),
            };
            tokio::spawn(async move { store.commit_vote(id, vote).await })
        });
        let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results.iter().filter(|r| matches!(r, Err(StoreError::AlreadyVoted))).count(), 49);

        let poll = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(poll.total_votes, 1);
        assert_consistent(&poll);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_submit_exactly_once_under_race() {
        let h = harness();
        let id = h.create(&["A", "B", "C"], true).await;
        let mut subscription = h.processor.publisher().subscribe(id);

        let voter = guest("shared-token");
        let attempts = (0..50).map(|i| {
            let processor = Arc::clone(&h.processor);
            let voter = voter.clone();
            tokio::spawn(async move { processor.submit_vote(id, &ballot(i % 3, "Ann"), &voter).await })
        });
        let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

        let committed: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(results.iter().filter(|r| matches!(r, Err(VoteError::AlreadyVoted))).count(), 49);

        let poll = h.stored(id).await;
        assert_eq!(poll.total_votes, 1);
        assert_consistent(&poll);

        let update = subscription.try_next().expect("one broadcast for the commit");
        assert_eq!(&update.poll, committed[0]);
        assert!(subscription.try_next().is_none(), "rejected attempts publish nothing");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_distinct_identities_all_commit() {
        let h = harness();
        let id = h.create(&["A", "B", "C"], true).await;
        let mut subscription = h.processor.publisher().subscribe(id);

        let attempts = (0..50).map(|i| {
            let processor = Arc::clone(&h.processor);
            tokio::spawn(async move {
                processor.submit_vote(id, &ballot(i % 3, &format!("voter {i}")), &guest(&format!("device-{i}"))).await
            })
        });
        let results = join_all(attempts).await;
        assert!(results.iter().all(|r| matches!(r, Ok(Ok(_)))));

        let poll = h.stored(id).await;
        assert_eq!(poll.total_votes, 50);
        assert_eq!(poll.options.iter().map(|o| o.count).collect::<Vec<_>>(), vec![17, 17, 16]);
        assert_consistent(&poll);

        let totals: Vec<u64> = std::iter::from_fn(|| subscription.try_next())
            .map(|u| u.poll.total_votes)
            .collect();
        assert_eq!(totals, (1..=50).collect::<Vec<u64>>(), "broadcasts follow commit order");
    }

    #[tokio::test]
    async fn test_creator_cannot_vote() {
        let h = harness();
        let id = h.create(&["A", "B", "C"], true).await;
        let mut subscription = h.processor.publisher().subscribe(id);
        let before = h.stored(id).await;

        for index in [-1, 0, 1, 2, 3] {
            let result = h.processor.submit_vote(id, &ballot(index, "Owner"), &h.creator).await;
            assert!(matches!(result, Err(VoteError::Forbidden(_))), "index {index}");
        }

        assert_eq!(h.stored(id).await, before);
        assert!(subscription.try_next().is_none());
    }

    #[tokio::test]
    async fn test_option_bounds() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        let before = h.stored(id).await;

        for index in [2, -1, i64::MAX] {
            let result = h.processor.submit_vote(id, &ballot(index, "Ann"), &guest("g")).await;
            assert_eq!(result, Err(VoteError::InvalidOption), "index {index}");
        }
        assert_eq!(h.stored(id).await, before);

        assert!(h.processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_runs_before_storage() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;

        let missing_index = SubmitVoteRequest { option_index: None, name: Some("Ann".into()) };
        assert_eq!(
            h.processor.submit_vote(id, &missing_index, &guest("g")).await,
            Err(VoteError::Validation(ValidationError::MissingOptionIndex))
        );
        assert_eq!(
            h.processor.submit_vote(id, &ballot(0, "  "), &guest("g")).await,
            Err(VoteError::Validation(ValidationError::MissingName))
        );
        // Field validation wins even when the poll does not exist.
        assert_eq!(
            h.processor.submit_vote(Uuid::new_v4(), &ballot(0, ""), &guest("g")).await,
            Err(VoteError::Validation(ValidationError::MissingName))
        );

        assert_eq!(h.stored(id).await.total_votes, 0);
    }

    #[tokio::test]
    async fn test_second_vote_is_conflict_without_side_effects() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        let mut subscription = h.processor.publisher().subscribe(id);
        let voter = user();

        let first = h.processor.submit_vote(id, &ballot(0, "Ann"), &voter).await.unwrap();
        assert_eq!(first.total_votes, 1);

        let again = h.processor.submit_vote(id, &ballot(1, "Ann"), &voter).await;
        assert_eq!(again, Err(VoteError::AlreadyVoted));

        let poll = h.stored(id).await;
        assert_eq!(poll.options[0].count, 1);
        assert_eq!(poll.options[1].count, 0);
        assert!(subscription.try_next().is_some());
        assert!(subscription.try_next().is_none());
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_one_event_per_commit() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        let other = h.create(&["X", "Y"], true).await;
        let publisher = h.processor.publisher();

        let mut first = publisher.subscribe(id);
        let mut second = publisher.subscribe(id);
        let mut elsewhere = publisher.subscribe(other);

        let committed = h.processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await.unwrap();

        assert_eq!(first.next().await.map(|u| u.poll), Some(committed.clone()));
        assert_eq!(second.next().await.map(|u| u.poll), Some(committed));
        assert!(first.try_next().is_none());
        assert!(second.try_next().is_none());
        assert!(elsewhere.try_next().is_none(), "other polls' channels stay quiet");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        h.processor.submit_vote(id, &ballot(0, "Ann"), &guest("g1")).await.unwrap();

        let mut late = h.processor.publisher().subscribe(id);
        assert!(late.try_next().is_none());

        h.processor.submit_vote(id, &ballot(1, "Bob"), &guest("g2")).await.unwrap();
        assert_eq!(late.try_next().map(|u| u.poll.total_votes), Some(2));
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_close_idle_channels() {
        let publisher = Publisher::new(8);
        let id = Uuid::new_v4();

        let a = publisher.subscribe(id);
        let b = publisher.subscribe(id);
        assert_eq!(publisher.subscriber_count(id), 2);

        drop(a);
        assert_eq!(publisher.subscriber_count(id), 1);
        assert_eq!(publisher.channel_count(), 1);

        drop(b);
        assert_eq!(publisher.channel_count(), 0);

        let poll = Poll::create(user(), &poll_request(&["A", "B"], true)).unwrap();
        let mut update = PollUpdate { poll: poll.public_aggregate() };
        update.poll.id = id;
        assert_eq!(publisher.publish(update), 0);
        assert_eq!(publisher.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_dropped_mid_wait_closes_channel() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        let publisher = Arc::clone(h.processor.publisher());

        let waiting = tokio::spawn(async move {
            let mut subscription = publisher.subscribe(id);
            subscription.next().await
        });
        while h.processor.publisher().subscriber_count(id) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.processor.publisher().channel_count(), 1);

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(h.processor.publisher().channel_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_commit_lanes_are_released() {
        let h = harness();
        let mut ids = Vec::new();
        for _ in 0..200 {
            ids.push(h.create(&["A", "B"], true).await);
        }

        let attempts = ids.iter().flat_map(|&id| {
            let voters = [guest(&format!("{id}-a")), guest(&format!("{id}-b"))];
            voters.into_iter().map(move |voter| (id, voter))
        }).map(|(id, voter)| {
            let processor = Arc::clone(&h.processor);
            tokio::spawn(async move { processor.submit_vote(id, &ballot(0, "Ann"), &voter).await })
        });
        assert!(join_all(attempts).await.iter().all(|r| matches!(r, Ok(Ok(_)))));

        // Rejected commits release their lane too.
        let again = h.processor.submit_vote(ids[0], &ballot(1, "Ann"), &guest(&format!("{}-a", ids[0]))).await;
        assert_eq!(again, Err(VoteError::AlreadyVoted));

        assert_eq!(h.processor.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_breakdown_is_owner_only() {
        let h = harness();
        let id = h.create(&["A", "B"], true).await;
        h.processor.submit_vote(id, &ballot(0, "Ann"), &guest("g1")).await.unwrap();
        h.processor.submit_vote(id, &ballot(1, "Bob"), &guest("g2")).await.unwrap();
        let voter = user();
        h.processor.submit_vote(id, &ballot(0, "Cy"), &voter).await.unwrap();

        for outsider in [user(), guest("g1"), voter] {
            assert!(matches!(
                h.processor.voter_breakdown(id, &outsider).await,
                Err(VoteError::Forbidden(_))
            ));
        }

        let breakdown = h.processor.voter_breakdown(id, &h.creator).await.unwrap();
        assert_eq!(breakdown.options[0].voters, vec!["Ann".to_string(), "Cy".to_string()]);
        assert_eq!(breakdown.options[1].voters, vec!["Bob".to_string()]);
        let listed: usize = breakdown.options.iter().map(|o| o.voters.len()).sum();
        assert_eq!(listed as u64, breakdown.total_votes);
    }

    #[tokio::test]
    async fn test_private_poll_visibility() {
        let h = harness();
        let id = h.create(&["A", "B"], false).await;

        assert!(matches!(h.processor.public_aggregate(id, None).await, Err(VoteError::Forbidden(_))));
        assert!(matches!(h.processor.public_aggregate(id, Some(&user())).await, Err(VoteError::Forbidden(_))));
        assert!(matches!(
            h.processor.submit_vote(id, &ballot(0, "Ann"), &guest("g")).await,
            Err(VoteError::Forbidden(_))
        ));
        assert!(matches!(h.processor.subscribe(id, Some(&guest("g"))).await, Err(VoteError::Forbidden(_))));

        let view = h.processor.public_aggregate(id, Some(&h.creator)).await.unwrap();
        assert!(!view.is_public);
        assert_eq!(view.total_votes, 0);
    }

    #[tokio::test]
    async fn test_unknown_poll() {
        let h = harness();
        let missing = Uuid::new_v4();

        assert_eq!(h.processor.submit_vote(missing, &ballot(0, "Ann"), &guest("g")).await, Err(VoteError::NotFound));
        assert_eq!(h.processor.public_aggregate(missing, None).await, Err(VoteError::NotFound));
        assert_eq!(h.processor.voter_breakdown(missing, &h.creator).await, Err(VoteError::NotFound));
    }

    #[tokio::test]
    async fn test_create_and_list_require_authentication() {
        let h = harness();
        let request = poll_request(&["A", "B"], true);

        assert_eq!(h.processor.create_poll(&guest("g"), &request).await, Err(VoteError::Unauthenticated));
        assert_eq!(h.processor.list_polls(&guest("g")).await, Err(VoteError::Unauthenticated));

        let first = h.create(&["A", "B"], true).await;
        let second = h.create(&["C", "D"], false).await;
        h.processor.create_poll(&user(), &request).await.unwrap();

        let mine: Vec<Uuid> = h.processor.list_polls(&h.creator).await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(mine.len(), 2);
        assert!(mine.contains(&first) && mine.contains(&second));
    }

    #[tokio::test]
    async fn test_inconsistent_tally_is_reported_not_served() {
        let h = harness();
        let mut poll = Poll::create(h.creator.clone(), &poll_request(&["A", "B"], true)).unwrap();
        poll.total_votes = 3;
        let id = poll.id;
        h.store.insert(poll).await.unwrap();

        assert!(matches!(h.processor.public_aggregate(id, None).await, Err(VoteError::Internal(_))));
        assert!(matches!(h.processor.voter_breakdown(id, &h.creator).await, Err(VoteError::Internal(_))));
    }

    /// Delays every commit so tests can observe timeouts and caller cancellation.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[rocket::async_trait]
    impl PollStore for SlowStore {
        async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
            self.inner.insert(poll).await
        }

        async fn fetch(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
            self.inner.fetch(id).await
        }

        async fn list_by_creator(&self, creator: &VoterIdentity) -> Result<Vec<Poll>, StoreError> {
            self.inner.list_by_creator(creator).await
        }

        async fn commit_vote(&self, id: Uuid, vote: VoterRecord) -> Result<Poll, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.commit_vote(id, vote).await
        }
    }

    /// Applies the commit, then stalls before acknowledging it.
    struct LateAckStore {
        inner: MemoryStore,
        stall: Duration,
    }

    #[rocket::async_trait]
    impl PollStore for LateAckStore {
        async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
            self.inner.insert(poll).await
        }

        async fn fetch(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
            self.inner.fetch(id).await
        }

        async fn list_by_creator(&self, creator: &VoterIdentity) -> Result<Vec<Poll>, StoreError> {
            self.inner.list_by_creator(creator).await
        }

        async fn commit_vote(&self, id: Uuid, vote: VoterRecord) -> Result<Poll, StoreError> {
            let poll = self.inner.commit_vote(id, vote).await?;
            tokio::time::sleep(self.stall).await;
            Ok(poll)
        }
    }

    #[tokio::test]
    async fn test_applied_commit_is_published_after_timeout() {
        init_tracing();
        let store = Arc::new(LateAckStore { inner: MemoryStore::new(), stall: Duration::from_millis(300) });
        let poll = Poll::create(user(), &poll_request(&["A", "B"], true)).unwrap();
        let id = poll.id;
        store.insert(poll).await.unwrap();
        let processor = VoteProcessor::new(store.clone(), Arc::new(Publisher::default()), Duration::from_millis(20));
        let mut subscription = processor.publisher().subscribe(id);

        let result = processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await;
        assert!(matches!(result, Err(VoteError::Internal(_))));

        let update = subscription.try_next().expect("applied vote is broadcast");
        assert_eq!(update.poll.total_votes, 1);
        assert_eq!(update.poll.options[1].count, 1);
        assert!(subscription.try_next().is_none());

        assert_eq!(
            processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await,
            Err(VoteError::AlreadyVoted)
        );
        assert_eq!(processor.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_commit_that_never_landed_publishes_nothing() {
        let (_store, processor, id) = slow_processor(Duration::from_millis(300), Duration::from_millis(20)).await;
        let mut subscription = processor.publisher().subscribe(id);

        let result = processor.submit_vote(id, &ballot(0, "Ann"), &guest("g")).await;
        assert!(matches!(result, Err(VoteError::Internal(_))));
        assert!(subscription.try_next().is_none());
    }

    async fn slow_processor(delay: Duration, store_timeout: Duration) -> (Arc<SlowStore>, Arc<VoteProcessor>, Uuid) {
        init_tracing();
        let store = Arc::new(SlowStore { inner: MemoryStore::new(), delay });
        let poll = Poll::create(user(), &poll_request(&["A", "B"], true)).unwrap();
        let id = poll.id;
        store.insert(poll).await.unwrap();
        let processor = VoteProcessor::new(store.clone(), Arc::new(Publisher::default()), store_timeout);
        (store, Arc::new(processor), id)
    }

    #[tokio::test]
    async fn test_storage_timeout_is_internal_and_leaves_no_vote() {
        let (store, processor, id) = slow_processor(Duration::from_millis(300), Duration::from_millis(20)).await;

        let result = processor.submit_vote(id, &ballot(0, "Ann"), &guest("g")).await;
        assert!(matches!(result, Err(VoteError::Internal(_))));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let poll = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(poll.total_votes, 0);
        assert_consistent(&poll);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_caller_disconnect_does_not_abort_commit() {
        let (store, processor, id) = slow_processor(Duration::from_millis(50), Duration::from_secs(5)).await;
        let mut subscription = processor.publisher().subscribe(id);

        let caller = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let poll = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(poll.total_votes, 1);
        assert_consistent(&poll);
        assert_eq!(subscription.try_next().map(|u| u.poll.total_votes), Some(1));

        // Retrying after the unseen success is a conflict, not a second vote.
        assert_eq!(
            processor.submit_vote(id, &ballot(1, "Ann"), &guest("g")).await,
            Err(VoteError::AlreadyVoted)
        );
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let defaults = AppConfig::default();
        assert_eq!(defaults.rate_limit_max_requests, 100);
        assert_eq!(defaults.rate_limit_window_minutes, 15);
        assert_eq!(defaults.store_timeout, Duration::from_millis(5000));
        assert_eq!(defaults.allowed_origins.len(), 3);

        let secrets: HashMap<&str, &str> = HashMap::from([
            ("ALLOWED_ORIGINS", "https://polls.example.com, ,http://localhost:5173"),
            ("RATE_LIMIT_MAX_REQUESTS", "7"),
            ("STORE_TIMEOUT_MS", "not-a-number"),
            ("BROADCAST_CAPACITY", "16"),
        ]);
        let config = AppConfig::load(|key| secrets.get(key).map(|v| v.to_string()));

        assert_eq!(config.allowed_origins, vec!["https://polls.example.com", "http://localhost:5173"]);
        assert_eq!(config.rate_limit_max_requests, 7);
        assert_eq!(config.store_timeout, Duration::from_millis(5000), "invalid values fall back");
        assert_eq!(config.broadcast_capacity, 16);
    }
}
