use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use sqlx::Row;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tokio::task::JoinHandle;

use super::{FeedRegistry, StoreError, TallyFeed, TallyStore};
use crate::models::{Identity, VoteTally, is_valid_choice_key};

// All writers NOTIFY on this channel; one listener task per store fans the
// refreshed documents out to local feeds.
const CHANGE_CHANNEL: &str = "jeju_poll_changes";

/// Tally store backed by Postgres.
///
/// Documents are rows keyed by (collection, doc_id) holding the flat counter
/// object as JSON text. Increments happen in a single UPDATE so concurrent
/// voters serialize on the row and no update is lost.
pub struct PostgresTallyStore {
    pool: PgPool,
    feeds: Arc<FeedRegistry>,
    listener: JoinHandle<()>,
}

impl PostgresTallyStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        Self::init_schema(&pool).await?;

        let feeds = Arc::new(FeedRegistry::new());
        let listener = Self::spawn_listener(pool.clone(), Arc::clone(&feeds)).await?;
        info!("Connected to tally database");

        Ok(Self {
            pool,
            feeds,
            listener,
        })
    }

    async fn init_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anonymous_sessions (
                uid TEXT PRIMARY KEY,
                signed_in_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn spawn_listener(
        pool: PgPool,
        feeds: Arc<FeedRegistry>,
    ) -> Result<JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let payload = notification.payload().to_string();
                        let Some((collection, id)) = payload.split_once(':') else {
                            warn!("Ignoring malformed change notification: {}", payload);
                            continue;
                        };
                        match fetch_document(&pool, collection, id).await {
                            Ok(Some(snapshot)) => feeds.publish(collection, id, &snapshot),
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Failed to refresh {}/{} after change: {}", collection, id, e)
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Change listener connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    async fn notify_change(&self, collection: &str, id: &str) {
        let payload = format!("{}:{}", collection, id);
        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            warn!("Failed to broadcast change for {}: {}", payload, e);
        }
    }
}

async fn fetch_document(
    pool: &PgPool,
    collection: &str,
    id: &str,
) -> Result<Option<VoteTally>, StoreError> {
    let row = sqlx::query("SELECT fields FROM poll_documents WHERE collection = $1 AND doc_id = $2")
        .bind(collection)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.get("fields");
            let tally = VoteTally::from_json(&raw).map_err(StoreError::Schema)?;
            Ok(Some(tally))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl TallyStore for PostgresTallyStore {
    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<VoteTally>, StoreError> {
        fetch_document(&self.pool, collection, id).await
    }

    async fn subscribe(&self, collection: &str, id: &str) -> Result<TallyFeed, StoreError> {
        let current = fetch_document(&self.pool, collection, id).await?;
        Ok(self.feeds.attach(collection, id, current))
    }

    async fn increment_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<(), StoreError> {
        if !is_valid_choice_key(field) {
            return Err(StoreError::Schema(format!("invalid choice key: {:?}", field)));
        }

        // One statement, so the row lock makes concurrent increments
        // compose without a read-modify-write race. A field missing from an
        // existing document starts from zero.
        let result = sqlx::query(
            r#"
            UPDATE poll_documents
            SET fields = (jsonb_set(
                    fields::jsonb,
                    ARRAY[$3],
                    to_jsonb(COALESCE((fields::jsonb ->> $3)::bigint, 0) + $4)
                ))::text,
                updated_at = $5
            WHERE collection = $1 AND doc_id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(delta as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        self.notify_change(collection, id).await;
        Ok(())
    }

    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        initial: &VoteTally,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO poll_documents (collection, doc_id, fields, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (collection, doc_id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(initial.to_json())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists);
        }

        self.notify_change(collection, id).await;
        Ok(())
    }

    async fn sign_in_anonymously(&self) -> Result<Identity, StoreError> {
        let identity = Identity::anonymous();

        sqlx::query("INSERT INTO anonymous_sessions (uid, signed_in_at) VALUES ($1, $2)")
            .bind(&identity.uid)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Auth(e.to_string()))?;

        Ok(identity)
    }
}

impl Drop for PostgresTallyStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
