//! # Tickwork
//!
//! ⏱ Cron jobs, watermarks, and resumable batch sync via Postgres.
//!
//! # Overview
//!
//! **Tickwork** runs named, cron-triggered background jobs across any number
//! of stateless worker processes that share a PostgreSQL database. There's no
//! broker: every process runs the same [`Scheduler`] over the same
//! [`JobRegistry`], and a TTL lock per job name makes sure at most one of them
//! runs a given job at a time.
//!
//! Key Features:
//!
//! - **Exclusive Runs**: Jobs are guarded by [`LockManager`] locks that expire
//!   on their own when a holder crashes, and can be renewed while a long run
//!   is in flight.
//! - **Cooperative Cancellation**: Runs carry a
//!   [`CancellationChannel`](cancel::CancellationChannel) so bodies can
//!   clean up when a deploy or shutdown interrupts them.
//! - **Resumable Work**: Watermarks in a [`CheckpointStore`] record how far a
//!   job has durably progressed, and never move backwards.
//! - **Bounded Fan-out**: [`executor::limit_concurrency`] runs sub-tasks with
//!   a parallelism ceiling, isolating their failures.
//! - **Batch Sync**: The [`sync`] engine keeps a derived store (such as a
//!   search index) in step with the database, draining a durable
//!   [`UpdateQueue`] and scanning new id ranges, with a hot-swapped full
//!   rebuild when needed.
//!
//! # Example
//!
//! A job that rolls up new rows since its last successful run, on whichever
//! node gets there first:
//!
//! ```rust,no_run
//! use std::{env, sync::Arc};
//!
//! use jiff::ToSpan;
//! use sqlx::PgPool;
//! use tickwork::{
//!     checkpoint::PgCheckpointStore, job::Context, lock::PgLockManager, CheckpointStore, Job,
//!     JobRegistry, Scheduler, SchedulerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let database_url = &env::var("DATABASE_URL")?;
//!     let pool = PgPool::connect(database_url).await?;
//!
//!     tickwork::MIGRATOR.run(&pool).await?;
//!
//!     let rollup = Job::builder()
//!         .name("metrics-rollup")
//!         .trigger("*/5 * * * *".parse()?)
//!         .body(|cx: Context<PgPool>| async move {
//!             let checkpoints = PgCheckpointStore::new(cx.state.clone());
//!             let checkpoint = checkpoints.checkpoint("metrics-rollup").await?;
//!
//!             // Roll up everything newer than `checkpoint.value()`...
//!
//!             checkpoint.advance().await?;
//!             Ok(())
//!         })
//!         .lock_ttl(10.minutes())
//!         .build();
//!
//!     let registry = JobRegistry::new([rollup])?;
//!     let scheduler = Scheduler::new(
//!         Arc::new(registry),
//!         PgLockManager::new(pool.clone()),
//!         pool,
//!         SchedulerConfig::default(),
//!     );
//!
//!     let handle = scheduler.start();
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! ## Jobs
//!
//! A job is a unique name, a [`Trigger`](job::Trigger), options, and an async
//! body. See [`job`] for details.
//!
//! ## Scheduling
//!
//! The scheduler evaluates triggers on a fixed tick, checks whether this node
//! may run a job, takes its lock, and runs it. See [`scheduler`].
//!
//! ## Locks and checkpoints
//!
//! Both have Postgres and in-memory implementations. See [`lock`] and
//! [`checkpoint`].
//!
//! ## Sync
//!
//! See [`sync`] for the batch synchronization engine and [`queue`] for the
//! update queue it drains.

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use crate::{
    checkpoint::CheckpointStore,
    config::SchedulerConfig,
    job::{Job, JobOptions},
    lock::LockManager,
    queue::UpdateQueue,
    registry::JobRegistry,
    scheduler::{Scheduler, SchedulerHandle},
    sync::{SyncEngine, SyncTarget},
};

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod job;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sync;

/// A SQLx [`Migrator`] which provides Tickwork's schema migrations.
///
/// These migrations must be applied before the Postgres lock manager,
/// checkpoint store, or update queue are used.
///
/// **Note**: Changes are managed within a dedicated schema, called "tickwork".
///
/// # Example
///
///```rust,no_run
/// # use tokio::runtime::Runtime;
/// use std::env;
///
/// use sqlx::PgPool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// // Set up the database connection pool.
/// let database_url = &env::var("DATABASE_URL")?;
/// let pool = PgPool::connect(database_url).await?;
///
/// // Run migrations.
/// tickwork::MIGRATOR.run(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
pub static MIGRATOR: Migrator = sqlx::migrate!();
