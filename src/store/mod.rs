pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::config::Config;
use crate::models::{Identity, VoteTally};

/// Collection holding every poll document.
pub const POLL_RESULTS: &str = "poll_results";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    #[error("document already exists")]
    AlreadyExists,
    #[error("anonymous sign-in failed: {0}")]
    Auth(String),
    #[error("malformed tally document: {0}")]
    Schema(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

/// Document store interface the poll widget is written against.
///
/// Backed by Postgres in production and by [`memory::MemoryTallyStore`] in
/// tests; the widget also accepts no store at all (offline demo mode).
#[async_trait]
pub trait TallyStore: Send + Sync {
    /// Fetch one document, `None` when it does not exist.
    async fn get_document(&self, collection: &str, id: &str)
    -> Result<Option<VoteTally>, StoreError>;

    /// Open a live feed of document snapshots. The current document is
    /// delivered immediately when it exists; an absent document delivers
    /// nothing until it is created.
    async fn subscribe(&self, collection: &str, id: &str) -> Result<TallyFeed, StoreError>;

    /// Atomic server-side increment of a single counter. Fails with
    /// [`StoreError::NotFound`] when the document does not exist.
    async fn increment_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<(), StoreError>;

    /// Create a document with the given initial counters. Fails with
    /// [`StoreError::AlreadyExists`] when another writer got there first.
    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        initial: &VoteTally,
    ) -> Result<(), StoreError>;

    async fn sign_in_anonymously(&self) -> Result<Identity, StoreError>;
}

/// Infinite, non-restartable sequence of tally snapshots for one document.
pub struct TallyFeed {
    rx: UnboundedReceiver<VoteTally>,
    handle: FeedHandle,
}

impl TallyFeed {
    /// Next snapshot, or `None` once the feed is cancelled or the store is
    /// gone. Snapshots replace whatever the consumer currently holds.
    pub async fn next(&mut self) -> Option<VoteTally> {
        let mut cancelled = std::pin::pin!(self.handle.notify.notified());
        // Register for the wakeup before reading the flag, otherwise a
        // cancel landing in between is never observed.
        cancelled.as_mut().enable();
        if self.handle.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = cancelled => None,
            snapshot = self.rx.recv() => snapshot,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        self.handle.clone()
    }
}

/// Cancellation handle for a [`TallyFeed`]. Cancelling is idempotent and
/// wakes a pending `next` call.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl FeedHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct FeedSender {
    tx: UnboundedSender<VoteTally>,
    handle: FeedHandle,
}

/// Fan-out of document snapshots to the feeds subscribed to them. Shared by
/// both store implementations.
#[derive(Default)]
pub(crate) struct FeedRegistry {
    feeds: Mutex<HashMap<(String, String), Vec<FeedSender>>>,
}

impl FeedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn attach(&self, collection: &str, id: &str, current: Option<VoteTally>) -> TallyFeed {
        let (tx, rx) = unbounded_channel();
        let handle = FeedHandle::new();

        if let Some(snapshot) = current {
            let _ = tx.send(snapshot);
        }

        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds
            .entry((collection.to_string(), id.to_string()))
            .or_default()
            .push(FeedSender {
                tx,
                handle: handle.clone(),
            });

        TallyFeed { rx, handle }
    }

    pub(crate) fn publish(&self, collection: &str, id: &str, snapshot: &VoteTally) {
        let key = (collection.to_string(), id.to_string());
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = feeds.get_mut(&key) {
            list.retain(|feed| !feed.handle.is_cancelled() && feed.tx.send(snapshot.clone()).is_ok());
            if list.is_empty() {
                feeds.remove(&key);
            }
        }
    }
}

/// Initialize the backing store from configuration.
///
/// Any failure here degrades to offline demo mode instead of propagating:
/// the page must keep working with the store absent. Anonymous sign-in
/// failure is logged and writes stay best-effort, matching the store's
/// access-control expectations.
pub async fn connect(config: &Config) -> Option<Arc<dyn TallyStore>> {
    let url = match &config.database_url {
        Some(url) => url,
        None => {
            info!("No tally database configured, running in offline demo mode");
            return None;
        }
    };

    match postgres::PostgresTallyStore::connect(url).await {
        Ok(store) => {
            match store.sign_in_anonymously().await {
                Ok(identity) => info!("Signed in anonymously as {}", identity.uid),
                Err(e) => warn!("Anonymous sign-in failed, writes are best-effort: {}", e),
            }
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!("Tally store initialization failed (demo mode active): {}", e);
            None
        }
    }
}
