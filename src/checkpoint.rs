//! Watermark checkpoints for incremental jobs.
//!
//! A checkpoint is the "last successful run" timestamp stored under a key the
//! job owns. Jobs read it once before doing any work, scope their query to
//! everything affected since that value, and advance it only after every
//! resulting write has committed:
//!
//! ```rust
//! use tickwork::checkpoint::{CheckpointStore, MemoryCheckpointStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCheckpointStore::new();
//!
//! // Read before work.
//! let checkpoint = store.checkpoint("metrics-rollup").await?;
//! let since = checkpoint.value();
//!
//! // ...process everything created after `since`...
//!
//! // Write after success.
//! checkpoint.advance().await?;
//! # Ok(())
//! # }
//! ```
//!
//! If the body fails before calling [`Checkpoint::advance`], the stored value
//! is untouched and the next run replays the same window.
//!
//! Stores never move a checkpoint backwards: writing an older value than the
//! one stored is a no-op. Use [`CheckpointStore::clear`] to reset one
//! explicitly.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use jiff::Timestamp;
use sqlx::PgPool;
use tracing::instrument;

/// A type alias for checkpoint results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate, e.g. a stored value out of range.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Durable key to timestamp storage.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Returns the stored value for `key`, if any.
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<Timestamp>>> + Send;

    /// Stores `value` under `key` unless a later value is already stored.
    ///
    /// Returns the value that's stored afterwards.
    fn store(&self, key: &str, value: Timestamp)
        -> impl Future<Output = Result<Timestamp>> + Send;

    /// Removes the stored value for `key`.
    fn clear(&self, key: &str) -> impl Future<Output = Result> + Send;

    /// Reads the checkpoint for `key`, defaulting to the Unix epoch.
    fn checkpoint(&self, key: &str) -> impl Future<Output = Result<Checkpoint<'_, Self>>> + Send
    where
        Self: Sized,
    {
        self.checkpoint_or(key, Timestamp::UNIX_EPOCH)
    }

    /// Reads the checkpoint for `key`, falling back to `default` when absent.
    fn checkpoint_or(
        &self,
        key: &str,
        default: Timestamp,
    ) -> impl Future<Output = Result<Checkpoint<'_, Self>>> + Send
    where
        Self: Sized,
    {
        async move {
            let stored = self.load(key).await?;
            Ok(Checkpoint {
                store: self,
                key: key.to_string(),
                value: stored.unwrap_or(default),
                stored: stored.is_some(),
            })
        }
    }
}

/// A checkpoint value paired with the means to advance it.
#[derive(Debug)]
pub struct Checkpoint<'a, S> {
    store: &'a S,
    key: String,
    value: Timestamp,
    stored: bool,
}

impl<S: CheckpointStore> Checkpoint<'_, S> {
    /// The checkpoint key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value read when this checkpoint was loaded.
    pub fn value(&self) -> Timestamp {
        self.value
    }

    /// Returns `true` if nothing was stored and the value is the default.
    pub fn is_initial(&self) -> bool {
        !self.stored
    }

    /// Advances the checkpoint to now.
    pub async fn advance(self) -> Result<Timestamp> {
        self.advance_to(Timestamp::now()).await
    }

    /// Advances the checkpoint to `value`.
    ///
    /// Values older than what's stored leave the checkpoint unchanged.
    pub async fn advance_to(self, value: Timestamp) -> Result<Timestamp> {
        let stored = self.store.store(&self.key, value).await?;
        tracing::debug!(checkpoint.key = %self.key, %stored, "Checkpoint advanced");
        Ok(stored)
    }
}

/// Checkpoints persisted in `tickwork.checkpoint`.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Creates a store using the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PgCheckpointStore {
    #[instrument(skip(self), err)]
    async fn load(&self, key: &str) -> Result<Option<Timestamp>> {
        let millis = sqlx::query_scalar::<_, i64>(
            r#"
            select value
            from tickwork.checkpoint
            where key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(millis.map(Timestamp::from_millisecond).transpose()?)
    }

    #[instrument(skip(self), err)]
    async fn store(&self, key: &str, value: Timestamp) -> Result<Timestamp> {
        let millis = sqlx::query_scalar::<_, i64>(
            r#"
            insert into tickwork.checkpoint (key, value)
            values ($1, $2)
            on conflict (key) do update
            set value = greatest(tickwork.checkpoint.value, excluded.value),
                updated_at = now()
            returning value
            "#,
        )
        .bind(key)
        .bind(value.as_millisecond())
        .fetch_one(&self.pool)
        .await?;

        Ok(Timestamp::from_millisecond(millis)?)
    }

    #[instrument(skip(self), err)]
    async fn clear(&self, key: &str) -> Result {
        sqlx::query(
            r#"
            delete from tickwork.checkpoint
            where key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Process-local checkpoints, useful for tests and single-node setups.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    values: Arc<Mutex<HashMap<String, Timestamp>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &str) -> Result<Option<Timestamp>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).copied())
    }

    async fn store(&self, key: &str, value: Timestamp) -> Result<Timestamp> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = values
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).max(value))
            .or_insert(value);
        Ok(*stored)
    }

    async fn clear(&self, key: &str) -> Result {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}
