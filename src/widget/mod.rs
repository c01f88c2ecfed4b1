use std::sync::{Arc, PoisonError, RwLock};

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::models::{Poll, VoteTally};
use crate::store::{FeedHandle, POLL_RESULTS, StoreError, TallyStore};
use crate::voter::VoterLedger;

/// What the page renders for one poll.
#[derive(Debug, Clone)]
pub struct PollState {
    pub has_voted: bool,
    pub tally: VoteTally,
}

/// State machine for one poll on the page.
///
/// Holds a local projection of the remote tally document and the client's
/// voted flag. Works with or without a backing store; without one, voting
/// still flips the flag and bumps the local projection (offline demo mode).
pub struct PollWidget {
    poll: Poll,
    store: Option<Arc<dyn TallyStore>>,
    ledger: Arc<VoterLedger>,
    state: Arc<RwLock<PollState>>,
    feed: Option<FeedHandle>,
    fold_task: Option<JoinHandle<()>>,
}

impl PollWidget {
    /// Build the widget in its initial state: voted flag from the ledger,
    /// tally from the poll's seed until a snapshot arrives.
    pub fn mount(poll: Poll, store: Option<Arc<dyn TallyStore>>, ledger: Arc<VoterLedger>) -> Self {
        let state = PollState {
            has_voted: ledger.has_voted(&poll.id),
            tally: poll.seed.clone(),
        };

        Self {
            poll,
            store,
            ledger,
            state: Arc::new(RwLock::new(state)),
            feed: None,
            fold_task: None,
        }
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Snapshot of the current render state.
    pub fn state(&self) -> PollState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to the remote document and start folding snapshots into
    /// the projection. One subscription per activation; a failed or absent
    /// store leaves the widget on its local tally.
    pub async fn activate(&mut self) {
        if self.feed.is_some() {
            warn!("Widget for {} is already active", self.poll.id);
            return;
        }

        let Some(store) = &self.store else {
            info!("Poll {} running offline, showing local tally only", self.poll.id);
            return;
        };

        let mut feed = match store.subscribe(POLL_RESULTS, &self.poll.id).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Subscription for {} failed, staying on local tally: {}", self.poll.id, e);
                return;
            }
        };

        self.feed = Some(feed.handle());

        let poll_id = self.poll.id.clone();
        let state = Arc::clone(&self.state);
        self.fold_task = Some(tokio::spawn(async move {
            while let Some(snapshot) = feed.next().await {
                info!("Tally for {} is now {:?}", poll_id, snapshot);
                let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
                // Snapshots replace the projection outright, so seeing our
                // own vote echoed back never counts it twice.
                state.tally = snapshot;
            }
        }));
    }

    /// Cast this client's vote for `choice`.
    ///
    /// Returns false without touching anything when the client has already
    /// voted or the choice is unknown. Otherwise: voted flag is flipped and
    /// persisted first, the local projection is bumped, and only then is
    /// the remote increment issued. Remote failure never rolls any of that
    /// back.
    pub async fn cast_vote(&self, choice: &str) -> bool {
        if !self.poll.has_choice(choice) {
            warn!("Ignoring vote for unknown choice {:?} in poll {}", choice, self.poll.id);
            return false;
        }

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.has_voted {
                return false;
            }
            state.has_voted = true;
        }
        self.ledger.record_vote(&self.poll.id);

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.tally.record(choice);
        }

        if let Some(store) = &self.store {
            self.push_vote(store.as_ref(), choice).await;
        }
        true
    }

    async fn push_vote(&self, store: &dyn TallyStore, choice: &str) {
        match store
            .increment_field(POLL_RESULTS, &self.poll.id, choice, 1)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                // First vote ever for this poll: seed the document with the
                // cast vote and every other known choice at zero.
                let mut initial = VoteTally::zeroed(&self.poll.choices);
                initial.record(choice);
                if let Err(e) = store
                    .create_document(POLL_RESULTS, &self.poll.id, &initial)
                    .await
                {
                    warn!("Could not seed tally document for {}: {}", self.poll.id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Vote for {:?} in {} was not recorded remotely: {}",
                    choice, self.poll.id, e
                );
            }
        }
    }

    /// Tear down the subscription. Safe to call any number of times.
    pub fn deactivate(&mut self) {
        if let Some(handle) = self.feed.take() {
            handle.cancel();
        }
        if let Some(task) = self.fold_task.take() {
            task.abort();
        }
    }
}

impl Drop for PollWidget {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::sleep;

    use super::*;
    use crate::store::memory::{MemoryTallyStore, WriteOp};

    const MAIN_POLL: &str = "jeju_main_poll";

    fn main_poll() -> Poll {
        Poll::with_seed(
            MAIN_POLL,
            &["optionA", "optionB"],
            VoteTally::seed([("optionA", 42), ("optionB", 12)]),
        )
    }

    fn temp_ledger() -> (TempDir, Arc<VoterLedger>) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(VoterLedger::open(&dir.path().join("voters.json")));
        (dir, ledger)
    }

    async fn seeded_store() -> Arc<MemoryTallyStore> {
        let store = Arc::new(MemoryTallyStore::new());
        store
            .create_document(
                POLL_RESULTS,
                MAIN_POLL,
                &VoteTally::seed([("optionA", 42), ("optionB", 12)]),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn vote_is_applied_optimistically_and_pushed() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let widget = PollWidget::mount(main_poll(), Some(store.clone()), Arc::clone(&ledger));

        assert!(widget.cast_vote("optionA").await);

        let state = widget.state();
        assert!(state.has_voted);
        assert_eq!(state.tally.count("optionA"), 43);
        assert_eq!(state.tally.count("optionB"), 12);
        assert!(ledger.has_voted(MAIN_POLL));

        // The store saw exactly one increment of exactly one.
        let writes = store.writes();
        assert_eq!(
            writes.last().unwrap(),
            &WriteOp::Increment {
                collection: POLL_RESULTS.to_string(),
                id: MAIN_POLL.to_string(),
                field: "optionA".to_string(),
                delta: 1,
            }
        );
        let doc = store.document(POLL_RESULTS, MAIN_POLL).unwrap();
        assert_eq!(doc.count("optionA"), 43);
    }

    #[tokio::test]
    async fn second_vote_is_a_no_op() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);

        assert!(widget.cast_vote("optionA").await);
        let writes_after_first = store.writes().len();
        let state_after_first = widget.state();

        assert!(!widget.cast_vote("optionB").await);
        assert!(!widget.cast_vote("optionA").await);

        let state = widget.state();
        assert_eq!(state.tally.count("optionA"), state_after_first.tally.count("optionA"));
        assert_eq!(state.tally.count("optionB"), state_after_first.tally.count("optionB"));
        assert_eq!(store.writes().len(), writes_after_first);
    }

    #[tokio::test]
    async fn persisted_voter_record_blocks_voting() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        ledger.record_vote(MAIN_POLL);
        let writes_before = store.writes().len();

        let widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);
        assert!(widget.state().has_voted);

        assert!(!widget.cast_vote("optionA").await);
        assert_eq!(widget.state().tally.count("optionA"), 42);
        assert_eq!(store.writes().len(), writes_before);
    }

    #[tokio::test]
    async fn missing_document_falls_back_to_one_create() {
        let store = Arc::new(MemoryTallyStore::new());
        let (_dir, ledger) = temp_ledger();
        let widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);

        assert!(widget.cast_vote("optionB").await);

        let writes = store.writes();
        assert_eq!(
            writes,
            vec![
                WriteOp::Increment {
                    collection: POLL_RESULTS.to_string(),
                    id: MAIN_POLL.to_string(),
                    field: "optionB".to_string(),
                    delta: 1,
                },
                WriteOp::Create {
                    collection: POLL_RESULTS.to_string(),
                    id: MAIN_POLL.to_string(),
                    fields: VoteTally::seed([("optionA", 0), ("optionB", 1)]),
                },
            ]
        );
        let doc = store.document(POLL_RESULTS, MAIN_POLL).unwrap();
        assert_eq!(doc.count("optionA"), 0);
        assert_eq!(doc.count("optionB"), 1);
    }

    #[tokio::test]
    async fn offline_vote_still_counts_locally() {
        let (_dir, ledger) = temp_ledger();
        let mut widget = PollWidget::mount(main_poll(), None, Arc::clone(&ledger));
        widget.activate().await;

        assert!(widget.cast_vote("optionA").await);

        let state = widget.state();
        assert!(state.has_voted);
        assert_eq!(state.tally.count("optionA"), 43);
        assert!(ledger.has_voted(MAIN_POLL));

        assert!(!widget.cast_vote("optionA").await);
    }

    #[tokio::test]
    async fn unknown_choice_is_rejected() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let writes_before = store.writes().len();
        let widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);

        assert!(!widget.cast_vote("optionC").await);

        let state = widget.state();
        assert!(!state.has_voted);
        assert_eq!(store.writes().len(), writes_before);
    }

    #[tokio::test]
    async fn snapshots_replace_the_projection() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let mut widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);
        widget.activate().await;

        // Another client's vote lands remotely.
        store
            .increment_field(POLL_RESULTS, MAIN_POLL, "optionB", 1)
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let state = widget.state();
        assert_eq!(state.tally.count("optionA"), 42);
        assert_eq!(state.tally.count("optionB"), 13);
    }

    #[tokio::test]
    async fn own_echo_is_not_double_counted() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let mut widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);
        widget.activate().await;

        assert!(widget.cast_vote("optionA").await);
        // Let the optimistic bump and the server echo both land.
        sleep(Duration::from_millis(50)).await;

        let state = widget.state();
        assert_eq!(state.tally.count("optionA"), 43);
        assert_eq!(state.tally.count("optionB"), 12);
    }

    #[tokio::test]
    async fn reactivation_leaves_the_first_subscription_running() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let mut widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);
        widget.activate().await;
        widget.activate().await;

        store
            .increment_field(POLL_RESULTS, MAIN_POLL, "optionA", 1)
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(widget.state().tally.count("optionA"), 43);
    }

    #[tokio::test]
    async fn deactivate_stops_the_feed() {
        let store = seeded_store().await;
        let (_dir, ledger) = temp_ledger();
        let mut widget = PollWidget::mount(main_poll(), Some(store.clone()), ledger);
        widget.activate().await;
        sleep(Duration::from_millis(20)).await;

        widget.deactivate();
        widget.deactivate();

        store
            .increment_field(POLL_RESULTS, MAIN_POLL, "optionA", 1)
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        // The remote count moved on, the torn-down widget did not.
        assert_eq!(widget.state().tally.count("optionA"), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_never_lose_votes() {
        let store = Arc::new(MemoryTallyStore::new());
        store
            .create_document(
                POLL_RESULTS,
                MAIN_POLL,
                &VoteTally::seed([("optionA", 0), ("optionB", 0)]),
            )
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                // Each simulated client has its own device-local ledger.
                let (_dir, ledger) = temp_ledger();
                let widget = PollWidget::mount(main_poll(), Some(store), ledger);
                let choice = if i % 2 == 0 { "optionA" } else { "optionB" };
                assert!(widget.cast_vote(choice).await);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let doc = store.document(POLL_RESULTS, MAIN_POLL).unwrap();
        assert_eq!(doc.count("optionA"), 5);
        assert_eq!(doc.count("optionB"), 5);
    }
}
