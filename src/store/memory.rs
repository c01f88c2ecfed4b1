use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{FeedRegistry, StoreError, TallyFeed, TallyStore};
use crate::models::{Identity, VoteTally};

/// One write accepted (or refused) by [`MemoryTallyStore`], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Increment {
        collection: String,
        id: String,
        field: String,
        delta: u64,
    },
    Create {
        collection: String,
        id: String,
        fields: VoteTally,
    },
}

/// In-memory tally store satisfying the full [`TallyStore`] contract.
///
/// Keeps a log of every write call so tests can assert the exact adapter
/// traffic a widget produced. Also usable as a process-local store for
/// demos.
#[derive(Default)]
pub struct MemoryTallyStore {
    docs: Mutex<HashMap<(String, String), VoteTally>>,
    feeds: FeedRegistry,
    writes: Mutex<Vec<WriteOp>>,
    deny_auth: AtomicBool,
}

impl MemoryTallyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sign_in_anonymously` fail from now on.
    pub fn deny_auth(&self) {
        self.deny_auth.store(true, Ordering::SeqCst);
    }

    /// Every write operation received so far, in order.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Synchronous document lookup for assertions.
    pub fn document(&self, collection: &str, id: &str) -> Option<VoteTally> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&doc_key(collection, id))
            .cloned()
    }

    fn record_write(&self, op: WriteOp) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

fn doc_key(collection: &str, id: &str) -> (String, String) {
    (collection.to_string(), id.to_string())
}

#[async_trait]
impl TallyStore for MemoryTallyStore {
    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<VoteTally>, StoreError> {
        Ok(self.document(collection, id))
    }

    async fn subscribe(&self, collection: &str, id: &str) -> Result<TallyFeed, StoreError> {
        let current = self.document(collection, id);
        Ok(self.feeds.attach(collection, id, current))
    }

    async fn increment_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<(), StoreError> {
        self.record_write(WriteOp::Increment {
            collection: collection.to_string(),
            id: id.to_string(),
            field: field.to_string(),
            delta,
        });

        let snapshot = {
            let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
            match docs.get_mut(&doc_key(collection, id)) {
                Some(tally) => {
                    tally.add(field, delta);
                    tally.clone()
                }
                None => return Err(StoreError::NotFound),
            }
        };

        self.feeds.publish(collection, id, &snapshot);
        Ok(())
    }

    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        initial: &VoteTally,
    ) -> Result<(), StoreError> {
        self.record_write(WriteOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: initial.clone(),
        });

        {
            let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
            let key = doc_key(collection, id);
            if docs.contains_key(&key) {
                return Err(StoreError::AlreadyExists);
            }
            docs.insert(key, initial.clone());
        }

        self.feeds.publish(collection, id, initial);
        Ok(())
    }

    async fn sign_in_anonymously(&self) -> Result<Identity, StoreError> {
        if self.deny_auth.load(Ordering::SeqCst) {
            return Err(StoreError::Auth("anonymous sign-in disabled".to_string()));
        }
        Ok(Identity::anonymous())
    }
}
