use std::collections::BTreeMap;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

lazy_static! {
    static ref CHOICE_KEY: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").unwrap();
}

// Choice keys double as document field names, so they are restricted to a
// shape every backing store accepts.
pub fn is_valid_choice_key(key: &str) -> bool {
    CHOICE_KEY.is_match(key)
}

/// A poll document: flat mapping from choice key to vote count.
///
/// Counts are non-negative and only ever go up; there is no decrement or
/// reset operation anywhere in the crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VoteTally {
    counts: BTreeMap<String, u64>,
}

impl VoteTally {
    /// Tally with every listed key present at zero.
    pub fn zeroed(keys: &[String]) -> Self {
        Self {
            counts: keys.iter().map(|k| (k.clone(), 0)).collect(),
        }
    }

    pub fn seed<'a>(pairs: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        Self {
            counts: pairs
                .into_iter()
                .map(|(k, n)| (k.to_string(), n))
                .collect(),
        }
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Increment one counter by one.
    pub fn record(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, delta: u64) {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(delta);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, n)| (k.as_str(), *n))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Parse and validate a raw document payload.
    ///
    /// Remote payloads are untrusted: anything other than a flat object of
    /// well-formed keys mapped to non-negative integers is rejected here,
    /// before it can reach widget state.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("not valid JSON: {}", e))?;

        let object = value
            .as_object()
            .ok_or_else(|| "document is not a JSON object".to_string())?;

        let mut counts = BTreeMap::new();
        for (key, count) in object {
            if !is_valid_choice_key(key) {
                return Err(format!("invalid choice key: {:?}", key));
            }
            let count = count
                .as_u64()
                .ok_or_else(|| format!("count for {:?} is not a non-negative integer", key))?;
            counts.insert(key.clone(), count);
        }

        Ok(Self { counts })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.counts).unwrap_or_default()
    }
}

/// Definition of one poll: a stable document id, the choice keys the page
/// offers, and the tally shown until the first remote snapshot arrives.
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: String,
    pub choices: Vec<String>,
    pub seed: VoteTally,
}

impl Poll {
    pub fn new(id: &str, choices: &[&str]) -> Self {
        let choices = choices
            .iter()
            .filter(|key| {
                let ok = is_valid_choice_key(key);
                if !ok {
                    warn!("Dropping malformed choice key {:?} from poll {}", key, id);
                }
                ok
            })
            .map(|key| key.to_string())
            .collect();

        Self {
            id: id.to_string(),
            choices,
            seed: VoteTally::default(),
        }
    }

    pub fn with_seed(id: &str, choices: &[&str], seed: VoteTally) -> Self {
        Self {
            seed,
            ..Self::new(id, choices)
        }
    }

    pub fn has_choice(&self, key: &str) -> bool {
        self.choices.iter().any(|c| c == key)
    }
}

/// Anonymous identity handed back by the store's sign-in. Only exists to
/// satisfy the store's requirement that writers are authenticated.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: String,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
        }
    }
}
