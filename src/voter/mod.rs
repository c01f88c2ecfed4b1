use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::warn;

fn marker_key(poll_id: &str) -> String {
    format!("{}_voted", poll_id)
}

/// Durable per-device record of which polls this client has voted in.
///
/// A JSON object file of `"<poll-id>_voted": "true"` entries, one per poll.
/// The flag is write-once: nothing in the application ever clears it.
pub struct VoterLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl VoterLedger {
    /// Open the ledger at `path`. Never fails: a missing file is a fresh
    /// client, an unreadable one is logged and treated as empty.
    pub fn open(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Voter ledger {} is unreadable, starting empty: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    pub fn has_voted(&self, poll_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&marker_key(poll_id)).map(String::as_str) == Some("true")
    }

    /// Set the voted flag and write it through synchronously, so a reload
    /// cannot cast a second vote. A write failure keeps the in-memory flag
    /// and is only logged.
    pub fn record_vote(&self, poll_id: &str) {
        let serialized = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(marker_key(poll_id), "true".to_string());
            serde_json::to_string(&*entries).unwrap_or_default()
        };

        if let Err(e) = fs::write(&self.path, serialized) {
            warn!("Could not persist voter ledger {}: {}", self.path.display(), e);
        }
    }
}
