//! Durable update/delete queue feeding incremental syncs.
//!
//! Write paths anywhere in the application enqueue `(entity_id, action)` pairs
//! against a sync target. The sync engine later lists everything pending,
//! pushes it, and commits exactly the entries it consumed:
//!
//! ```rust
//! use tickwork::queue::{MemoryUpdateQueue, SyncAction, UpdateQueue};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tickwork::queue::Error> {
//! let queue = MemoryUpdateQueue::new();
//!
//! queue.enqueue("articles", 42, SyncAction::Update).await?;
//! queue.enqueue("articles", 7, SyncAction::Delete).await?;
//!
//! let pending = queue.pending("articles").await?;
//! let ids = pending.iter().map(|entry| entry.id).collect::<Vec<_>>();
//!
//! // ...push the changes...
//!
//! queue.commit("articles", &ids).await?;
//! assert!(queue.pending("articles").await?.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! Commits are keyed by entry id, never by content. An entity enqueued again
//! while a drain is in progress gets a fresh entry that survives the commit
//! and is picked up by the next drain.
//!
//! With Postgres, enqueue inside the same transaction as the write that
//! caused it via [`PgUpdateQueue::enqueue_using`], so the change and its
//! queue entry commit together.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use tracing::instrument;

/// A type alias for queue results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Primary id of a synced entity.
pub type EntityId = i64;

/// Unique id of a queue entry.
pub type EntryId = i64;

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// What should happen to an entity in the sync target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "tickwork.sync_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Re-pull the entity and upsert it.
    Update,

    /// Remove the entity from the target.
    Delete,
}

/// A pending queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateQueueEntry {
    /// Unique entry id, increasing in enqueue order.
    pub id: EntryId,

    /// The entity to resync.
    pub entity_id: EntityId,

    /// What to do with it.
    pub action: SyncAction,

    /// When the entry was enqueued.
    pub enqueued_at: Timestamp,
}

/// The net change for one entity after collapsing its queue entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// The entity to resync.
    pub entity_id: EntityId,

    /// The action of the entity's latest entry.
    pub action: SyncAction,

    /// Every entry this change consumes.
    pub entry_ids: Vec<EntryId>,
}

/// Collapses queue entries into one change per entity.
///
/// The latest entry for an entity decides its action; all of its entry ids
/// are carried along so they can be committed together. Changes are ordered
/// by entity id.
pub fn collapse(entries: &[UpdateQueueEntry]) -> Vec<PendingChange> {
    let mut ordered = entries.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|entry| entry.id);

    let mut changes: BTreeMap<EntityId, PendingChange> = BTreeMap::new();
    for entry in ordered {
        changes
            .entry(entry.entity_id)
            .and_modify(|change| {
                change.action = entry.action;
                change.entry_ids.push(entry.id);
            })
            .or_insert_with(|| PendingChange {
                entity_id: entry.entity_id,
                action: entry.action,
                entry_ids: vec![entry.id],
            });
    }

    changes.into_values().collect()
}

/// Durable per-target queue of entity changes.
pub trait UpdateQueue: Send + Sync + 'static {
    /// Appends a change for `entity_id` to `target`'s queue.
    fn enqueue(
        &self,
        target: &str,
        entity_id: EntityId,
        action: SyncAction,
    ) -> impl Future<Output = Result<EntryId>> + Send;

    /// Lists every pending entry for `target`, oldest first.
    fn pending(&self, target: &str) -> impl Future<Output = Result<Vec<UpdateQueueEntry>>> + Send;

    /// Removes exactly the given entries from `target`'s queue.
    ///
    /// Returns how many entries were removed. Ids that are already gone are
    /// ignored.
    fn commit(
        &self,
        target: &str,
        entry_ids: &[EntryId],
    ) -> impl Future<Output = Result<u64>> + Send;
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    entity_id: i64,
    action: SyncAction,
    enqueued_at_ms: i64,
}

impl TryFrom<EntryRow> for UpdateQueueEntry {
    type Error = Error;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            entity_id: row.entity_id,
            action: row.action,
            enqueued_at: Timestamp::from_millisecond(row.enqueued_at_ms)?,
        })
    }
}

/// Queue persisted in `tickwork.sync_queue`.
#[derive(Debug, Clone)]
pub struct PgUpdateQueue {
    pool: PgPool,
}

impl PgUpdateQueue {
    /// Creates a queue using the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Same as [`UpdateQueue::enqueue`], using the provided executor.
    ///
    /// Pass a transaction to make the entry visible only once the write that
    /// caused it commits.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use sqlx::PgPool;
    /// use tickwork::queue::{PgUpdateQueue, SyncAction};
    ///
    /// # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    /// let queue = PgUpdateQueue::new(pool.clone());
    ///
    /// let mut tx = pool.begin().await?;
    /// sqlx::query("update article set title = $1 where id = $2")
    ///     .bind("New title")
    ///     .bind(42_i64)
    ///     .execute(&mut *tx)
    ///     .await?;
    /// queue
    ///     .enqueue_using(&mut *tx, "articles", 42, SyncAction::Update)
    ///     .await?;
    /// tx.commit().await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(
        skip(self, executor),
        fields(queue.entry_id = tracing::field::Empty),
        err
    )]
    pub async fn enqueue_using<'a, E>(
        &self,
        executor: E,
        target: &str,
        entity_id: EntityId,
        action: SyncAction,
    ) -> Result<EntryId>
    where
        E: PgExecutor<'a>,
    {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            insert into tickwork.sync_queue (target, entity_id, action)
            values ($1, $2, $3)
            returning id
            "#,
        )
        .bind(target)
        .bind(entity_id)
        .bind(action)
        .fetch_one(executor)
        .await?;

        tracing::Span::current().record("queue.entry_id", id);

        Ok(id)
    }
}

impl UpdateQueue for PgUpdateQueue {
    async fn enqueue(
        &self,
        target: &str,
        entity_id: EntityId,
        action: SyncAction,
    ) -> Result<EntryId> {
        self.enqueue_using(&self.pool, target, entity_id, action).await
    }

    #[instrument(skip(self), err)]
    async fn pending(&self, target: &str) -> Result<Vec<UpdateQueueEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            select
              id,
              entity_id,
              action,
              (extract(epoch from enqueued_at) * 1000)::bigint as enqueued_at_ms
            from tickwork.sync_queue
            where target = $1
            order by id
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UpdateQueueEntry::try_from).collect()
    }

    #[instrument(skip(self, entry_ids), fields(entries = entry_ids.len()), err)]
    async fn commit(&self, target: &str, entry_ids: &[EntryId]) -> Result<u64> {
        if entry_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            delete from tickwork.sync_queue
            where target = $1 and id = any($2)
            "#,
        )
        .bind(target)
        .bind(entry_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    last_id: EntryId,
    entries: Vec<(String, UpdateQueueEntry)>,
}

/// Process-local queue, useful for tests and single-node setups.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdateQueue {
    state: Arc<Mutex<MemoryQueueState>>,
}

impl MemoryUpdateQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateQueue for MemoryUpdateQueue {
    async fn enqueue(
        &self,
        target: &str,
        entity_id: EntityId,
        action: SyncAction,
    ) -> Result<EntryId> {
        let mut state = self.lock_state();
        state.last_id += 1;
        let entry = UpdateQueueEntry {
            id: state.last_id,
            entity_id,
            action,
            enqueued_at: Timestamp::now(),
        };
        state.entries.push((target.to_string(), entry));
        Ok(state.last_id)
    }

    async fn pending(&self, target: &str) -> Result<Vec<UpdateQueueEntry>> {
        let state = self.lock_state();
        Ok(state
            .entries
            .iter()
            .filter(|(entry_target, _)| entry_target == target)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn commit(&self, target: &str, entry_ids: &[EntryId]) -> Result<u64> {
        let mut state = self.lock_state();
        let before = state.entries.len();
        state.entries.retain(|(entry_target, entry)| {
            entry_target != target || !entry_ids.contains(&entry.id)
        });
        Ok((before - state.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_ids(entries: &[UpdateQueueEntry]) -> Vec<EntityId> {
        entries.iter().map(|entry| entry.entity_id).collect()
    }

    #[tokio::test]
    async fn pending_lists_entries_in_enqueue_order() -> Result {
        let queue = MemoryUpdateQueue::new();

        for entity_id in [12, 5, 9] {
            queue.enqueue("articles", entity_id, SyncAction::Update).await?;
        }
        queue.enqueue("images", 1, SyncAction::Update).await?;

        let pending = queue.pending("articles").await?;
        assert_eq!(entity_ids(&pending), vec![12, 5, 9]);
        assert!(pending.windows(2).all(|pair| pair[0].id < pair[1].id));

        Ok(())
    }

    #[tokio::test]
    async fn commit_removes_only_consumed_entries() -> Result {
        let queue = MemoryUpdateQueue::new();

        queue.enqueue("articles", 5, SyncAction::Update).await?;
        queue.enqueue("articles", 9, SyncAction::Update).await?;
        let drained = queue.pending("articles").await?;

        // A write path enqueues the same entity while the drain is running.
        queue.enqueue("articles", 9, SyncAction::Update).await?;

        let ids = drained.iter().map(|entry| entry.id).collect::<Vec<_>>();
        assert_eq!(queue.commit("articles", &ids).await?, 2);

        let remaining = queue.pending("articles").await?;
        assert_eq!(entity_ids(&remaining), vec![9]);

        // Committing again is harmless.
        assert_eq!(queue.commit("articles", &ids).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn commit_is_scoped_to_target() -> Result {
        let queue = MemoryUpdateQueue::new();

        let id = queue.enqueue("articles", 1, SyncAction::Update).await?;
        queue.enqueue("images", 1, SyncAction::Update).await?;

        assert_eq!(queue.commit("images", &[id]).await?, 0);
        assert_eq!(queue.pending("articles").await?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn collapse_dedupes_entities() -> Result {
        let queue = MemoryUpdateQueue::new();
        for entity_id in [5, 9, 9, 12] {
            queue.enqueue("articles", entity_id, SyncAction::Update).await?;
        }

        let changes = collapse(&queue.pending("articles").await?);

        assert_eq!(
            changes
                .iter()
                .map(|change| change.entity_id)
                .collect::<Vec<_>>(),
            vec![5, 9, 12]
        );
        assert_eq!(changes[1].entry_ids, vec![2, 3]);

        Ok(())
    }

    #[test]
    fn latest_entry_decides_action() {
        let at = Timestamp::UNIX_EPOCH;
        let entry = |id, entity_id, action| UpdateQueueEntry {
            id,
            entity_id,
            action,
            enqueued_at: at,
        };

        // Out of order on purpose: ids decide recency.
        let changes = collapse(&[
            entry(3, 7, SyncAction::Delete),
            entry(1, 7, SyncAction::Update),
            entry(2, 8, SyncAction::Delete),
            entry(4, 8, SyncAction::Update),
        ]);

        assert_eq!(
            changes,
            vec![
                PendingChange {
                    entity_id: 7,
                    action: SyncAction::Delete,
                    entry_ids: vec![1, 3],
                },
                PendingChange {
                    entity_id: 8,
                    action: SyncAction::Update,
                    entry_ids: vec![2, 4],
                },
            ]
        );
    }

    #[test]
    fn action_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SyncAction::Delete).expect("serializes"),
            r#""delete""#
        );
    }

    #[sqlx::test]
    async fn pg_queue_commits_by_entry_id(pool: PgPool) -> Result {
        let queue = PgUpdateQueue::new(pool.clone());

        let mut tx = pool.begin().await?;
        queue
            .enqueue_using(&mut *tx, "articles", 5, SyncAction::Update)
            .await?;
        queue
            .enqueue_using(&mut *tx, "articles", 6, SyncAction::Delete)
            .await?;
        tx.commit().await?;

        let drained = queue.pending("articles").await?;
        assert_eq!(entity_ids(&drained), vec![5, 6]);
        assert_eq!(drained[1].action, SyncAction::Delete);

        queue.enqueue("articles", 5, SyncAction::Update).await?;

        let ids = drained.iter().map(|entry| entry.id).collect::<Vec<_>>();
        assert_eq!(queue.commit("articles", &ids).await?, 2);
        assert_eq!(entity_ids(&queue.pending("articles").await?), vec![5]);

        Ok(())
    }
}
