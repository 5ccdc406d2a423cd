//! Distributed mutual exclusion keyed by job name.
//!
//! Many stateless processes evaluate the same job registry on the same clock.
//! Before running a job, each of them tries to acquire the job's lock; at most
//! one succeeds and the rest skip the tick. Contention is expected and isn't
//! an error: [`LockManager::try_acquire`] simply returns `None`.
//!
//! Locks carry a time-to-live. A holder that crashes never releases its lock,
//! so expiry is what eventually frees the key for the next tick. That's the
//! only defense against stuck holders, which means job bodies must tolerate
//! being invoked twice around the TTL boundary. Holders may
//! [renew](LockManager::renew) a lock to push its expiry out.
//!
//! # Postgres
//!
//! [`PgLockManager`] keeps one row per key in `tickwork.job_lock` and acquires
//! with a single upsert that only overwrites an expired row, so concurrent
//! acquisitions are arbitrated by the database.

use std::{
    collections::{hash_map::Entry, HashMap},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration as StdDuration,
};

use jiff::{tz::TimeZone, Span, Timestamp, Zoned};
use sqlx::PgPool;
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

/// A type alias for lock results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Lock errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate, e.g. a TTL that isn't a fixed
    /// duration.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// A held lock.
#[derive(Debug, Clone)]
pub struct Lock {
    key: String,
    holder_id: Uuid,
    acquired_at: Timestamp,
    ttl: Span,
}

impl Lock {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifies this holder; release and renewal only apply to it.
    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }

    /// When the lock was acquired.
    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    /// The time-to-live the lock was acquired with.
    pub fn ttl(&self) -> Span {
        self.ttl
    }
}

/// TTL-based mutual exclusion.
pub trait LockManager: Send + Sync + 'static {
    /// Attempts to acquire `key` for `ttl`.
    ///
    /// Returns `None` when another holder's lock hasn't expired yet.
    fn try_acquire(&self, key: &str, ttl: Span)
        -> impl Future<Output = Result<Option<Lock>>> + Send;

    /// Releases the lock.
    ///
    /// Returns `false` if the lock was no longer held by this holder, e.g.
    /// because it expired and someone else acquired it.
    fn release(&self, lock: &Lock) -> impl Future<Output = Result<bool>> + Send;

    /// Extends the lock by its TTL, measured from now.
    ///
    /// Returns `false` if the lock has already expired or changed hands.
    fn renew(&self, lock: &Lock) -> impl Future<Output = Result<bool>> + Send;
}

fn new_holder_id() -> Uuid {
    Ulid::new().into()
}

// Calendar units (days and up) are measured from now, in UTC.
pub(crate) fn ttl_duration(ttl: Span) -> Result<StdDuration> {
    let now = Zoned::now().with_time_zone(TimeZone::UTC);
    let expires_at = now.checked_add(ttl)?;
    Ok(StdDuration::try_from(now.duration_until(&expires_at))?)
}

fn ttl_millis(ttl: Span) -> Result<i64> {
    let millis = ttl_duration(ttl)?.as_millis();
    Ok(i64::try_from(millis).unwrap_or(i64::MAX))
}

/// Locks persisted in `tickwork.job_lock`.
#[derive(Debug, Clone)]
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    /// Creates a lock manager using the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LockManager for PgLockManager {
    #[instrument(skip(self, ttl), fields(lock.holder_id = tracing::field::Empty), err)]
    async fn try_acquire(&self, key: &str, ttl: Span) -> Result<Option<Lock>> {
        let holder_id = new_holder_id();

        let acquired_at_ms = sqlx::query_scalar::<_, i64>(
            r#"
            insert into tickwork.job_lock (key, holder_id, acquired_at, expires_at)
            values ($1, $2, now(), now() + $3::bigint * interval '1 millisecond')
            on conflict (key) do update
            set holder_id = excluded.holder_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            where tickwork.job_lock.expires_at <= now()
            returning (extract(epoch from acquired_at) * 1000)::bigint
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .bind(ttl_millis(ttl)?)
        .fetch_optional(&self.pool)
        .await?;

        let Some(acquired_at_ms) = acquired_at_ms else {
            return Ok(None);
        };

        tracing::Span::current().record("lock.holder_id", holder_id.as_hyphenated().to_string());

        Ok(Some(Lock {
            key: key.to_string(),
            holder_id,
            acquired_at: Timestamp::from_millisecond(acquired_at_ms)?,
            ttl,
        }))
    }

    #[instrument(
        skip(self, lock),
        fields(lock.key = %lock.key, lock.holder_id = %lock.holder_id),
        err
    )]
    async fn release(&self, lock: &Lock) -> Result<bool> {
        let result = sqlx::query(
            r#"
            delete from tickwork.job_lock
            where key = $1
              and holder_id = $2
            "#,
        )
        .bind(&lock.key)
        .bind(lock.holder_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, lock),
        fields(lock.key = %lock.key, lock.holder_id = %lock.holder_id),
        err
    )]
    async fn renew(&self, lock: &Lock) -> Result<bool> {
        let result = sqlx::query(
            r#"
            update tickwork.job_lock
            set expires_at = now() + $3::bigint * interval '1 millisecond'
            where key = $1
              and holder_id = $2
              and expires_at > now()
            "#,
        )
        .bind(&lock.key)
        .bind(lock.holder_id)
        .bind(ttl_millis(lock.ttl)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug)]
struct Held {
    holder_id: Uuid,
    expires_at: tokio::time::Instant,
}

/// Process-local locks.
///
/// Only excludes runners within one process; useful for tests and
/// single-node deployments. Expiry follows Tokio's clock, so paused-time
/// tests can step over TTLs.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashMap<String, Held>>>,
}

impl MemoryLockManager {
    /// Creates a lock manager with no locks held.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Span) -> Result<Option<Lock>> {
        let expires_at = tokio::time::Instant::now() + ttl_duration(ttl)?;
        let holder_id = new_holder_id();

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().expires_at > tokio::time::Instant::now() => {
                return Ok(None);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Held {
                    holder_id,
                    expires_at,
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Held {
                    holder_id,
                    expires_at,
                });
            }
        }

        Ok(Some(Lock {
            key: key.to_string(),
            holder_id,
            acquired_at: Timestamp::now(),
            ttl,
        }))
    }

    async fn release(&self, lock: &Lock) -> Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get(&lock.key) {
            Some(current) if current.holder_id == lock.holder_id => {
                held.remove(&lock.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(&self, lock: &Lock) -> Result<bool> {
        let ttl = ttl_duration(lock.ttl)?;
        let now = tokio::time::Instant::now();

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get_mut(&lock.key) {
            Some(current) if current.holder_id == lock.holder_id && current.expires_at > now => {
                current.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
