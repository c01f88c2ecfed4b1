use std::env;
use std::path::PathBuf;

use log::info;

const DATABASE_URL_VAR: &str = "JEJU_TALLY_DATABASE_URL";
const LEDGER_PATH_VAR: &str = "JEJU_VOTER_LEDGER";
const DEMO_VOTE_VAR: &str = "JEJU_VOTE";

const DEFAULT_LEDGER_PATH: &str = "jeju_voters.json";

/// Runtime configuration, read from the environment (and `.env` via the
/// runner's dotenv call).
///
/// The fallback for every unset variable keeps the page working: no
/// database URL means offline demo mode, not a startup failure.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL of the tally store. `None` switches the whole crate to
    /// offline demo mode.
    pub database_url: Option<String>,
    /// Where the per-device voter ledger lives.
    pub ledger_path: PathBuf,
    /// Optional choice key the runner casts on the main poll at startup.
    pub demo_vote: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = env::var(DATABASE_URL_VAR).ok().filter(|url| !url.is_empty());
        if database_url.is_none() {
            info!("{} not set, tally sync disabled", DATABASE_URL_VAR);
        }

        let ledger_path = env::var(LEDGER_PATH_VAR)
            .unwrap_or_else(|_| DEFAULT_LEDGER_PATH.to_string());

        Self {
            database_url,
            ledger_path: PathBuf::from(ledger_path),
            demo_vote: env::var(DEMO_VOTE_VAR).ok().filter(|v| !v.is_empty()),
        }
    }
}
