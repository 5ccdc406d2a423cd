//! The per-process loop that fires jobs.
//!
//! Every node runs a [`Scheduler`] over the same [`JobRegistry`]. On each
//! tick the scheduler works out which jobs are due, and for each of them:
//!
//! 1. skips it if this node isn't eligible (see below),
//! 2. tries to take the job's lock from the [`LockManager`], skipping the
//!    job quietly if another node holds it,
//! 3. runs the job and releases the lock once the run settles.
//!
//! Each due job is dispatched on its own task, so a long run never delays
//! the loop or any other job.
//!
//! A tick that finds a job's fire time already passed fires it once; missed
//! fires are skipped, never queued. Fire times are tracked per job name, so
//! jobs are fully independent of each other.
//!
//! # Eligibility
//!
//! Jobs marked [`dedicated`](crate::JobOptions::dedicated) only run on the
//! node whose `node_id` equals the config's `designated_node`. Jobs with a
//! [`queue_class`](crate::JobOptions::queue_class) only run on nodes serving
//! that class; a node serves every class when its `queue_classes` is empty.
//!
//! # Shutdown
//!
//! Cancelling the shutdown token stops the loop, fires the cancellation
//! callbacks of every in-flight run, and waits up to
//! [`shutdown_grace`](crate::SchedulerConfig::shutdown_grace) for them to
//! settle.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sqlx::PgPool;
//! use tickwork::{lock::PgLockManager, JobRegistry, Scheduler, SchedulerConfig};
//!
//! # async fn example(
//! #     pool: PgPool,
//! #     registry: JobRegistry<PgPool>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(
//!     Arc::new(registry),
//!     PgLockManager::new(pool.clone()),
//!     pool,
//!     SchedulerConfig::default(),
//! );
//!
//! let handle = scheduler.start();
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration as StdDuration,
};

use jiff::{Span, Timestamp};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    cancel::CancellationChannel,
    config::SchedulerConfig,
    job::{self, Job, JobOptions, Outcome, Run, RunId},
    lock::{self, Lock, LockManager},
    registry::JobRegistry,
};

/// A type alias for scheduler results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// Lock manager error.
    #[error(transparent)]
    Lock(#[from] lock::Error),

    /// No job is registered under the name.
    #[error("No job named `{0}` is registered")]
    UnknownJob(String),

    /// The scheduler task panicked.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Why a node passed on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    /// The job is dedicated and this isn't the designated node.
    NotDesignatedNode,

    /// This node doesn't serve the job's queue class.
    QueueClass(String),
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDesignatedNode => f.write_str("not the designated node"),
            Self::QueueClass(class) => write!(f, "queue class `{class}` not served"),
        }
    }
}

/// What happened when a job was dispatched.
#[derive(Debug)]
pub enum Dispatch {
    /// The node isn't eligible to run the job.
    Ineligible(Ineligible),

    /// Another holder has the job's lock.
    Contended,

    /// The job ran to completion.
    Completed(job::Result<Outcome>),

    /// The job is running in the background.
    Detached(RunId),
}

type InFlight = Arc<Mutex<HashMap<RunId, CancellationChannel>>>;

/// Fires registered jobs on their triggers.
pub struct Scheduler<S, L> {
    registry: Arc<JobRegistry<S>>,
    locks: Arc<L>,
    state: S,
    config: SchedulerConfig,
    next_fires: Arc<Mutex<HashMap<String, Timestamp>>>,
    in_flight: InFlight,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl<S: Clone, L> Clone for Scheduler<S, L> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            locks: self.locks.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            next_fires: self.next_fires.clone(),
            in_flight: self.in_flight.clone(),
            tracker: self.tracker.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<S, L> fmt::Debug for Scheduler<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.registry.len())
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<S, L> Scheduler<S, L> {
    /// The scheduler's config.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The token that stops the scheduler.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Sets the token that stops the scheduler.
    pub fn set_shutdown_token(&mut self, shutdown_token: CancellationToken) {
        self.shutdown_token = shutdown_token;
    }

    /// Number of runs currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<S, L> Scheduler<S, L>
where
    S: Clone + Send + Sync + 'static,
    L: LockManager,
{
    /// Creates a scheduler.
    ///
    /// `state` is cloned into every run's context.
    pub fn new(registry: Arc<JobRegistry<S>>, locks: L, state: S, config: SchedulerConfig) -> Self {
        Self {
            registry,
            locks: Arc::new(locks),
            state,
            config,
            next_fires: Arc::default(),
            in_flight: Arc::default(),
            tracker: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Runs the scheduler on a background task.
    pub fn start(self) -> SchedulerHandle {
        let shutdown_token = self.shutdown_token.clone();
        let task = tokio::spawn(async move { self.run().await });

        SchedulerHandle {
            task,
            shutdown_token,
        }
    }

    /// Runs the scheduler loop at the configured tick until shut down.
    pub async fn run(&self) -> Result {
        self.run_every(self.config.tick).await
    }

    /// Runs the scheduler loop, evaluating triggers every `period`, until
    /// shut down.
    #[instrument(skip(self), fields(node.id = %self.config.node_id), err)]
    pub async fn run_every(&self, period: Span) -> Result {
        let mut interval = tokio::time::interval(period.try_into()?);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(jobs = self.registry.len(), "Scheduler started");

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    break;
                }

                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        self.drain().await
    }

    /// Hands every due job to its own dispatch task.
    ///
    /// Returns how many jobs were handed off. Never waits on a job body, so a
    /// long run holds up neither the loop nor other jobs.
    pub fn tick(&self) -> usize {
        let mut handed_off = 0;

        for job in self.due_jobs(Timestamp::now()) {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            let scheduler = self.clone();
            let job = job.clone();
            self.tracker.spawn(
                async move {
                    // Errors are recorded on the dispatch span.
                    let _ = scheduler.dispatch(&job).await;
                }
                .in_current_span(),
            );

            handed_off += 1;
        }

        handed_off
    }

    /// Runs the named job now, regardless of its trigger.
    ///
    /// Eligibility and locking apply as they do on a tick.
    #[instrument(skip(self), err)]
    pub async fn trigger(&self, name: &str) -> Result<Dispatch> {
        let job = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))?;

        self.dispatch(job).await
    }

    /// Locks and runs a job.
    ///
    /// Jobs that wait for completion are awaited here and hold their lock
    /// until they settle; others are detached and release their lock when
    /// they settle.
    #[instrument(
        skip_all,
        fields(job.name = job.name(), run.id = tracing::field::Empty),
        err
    )]
    pub async fn dispatch(&self, job: &Job<S>) -> Result<Dispatch> {
        let options = job.options();

        if let Err(reason) = self.check_eligibility(options) {
            tracing::debug!(%reason, "Skipping job");
            return Ok(Dispatch::Ineligible(reason));
        }

        let renew_every = if options.renews_lock() {
            Some(renewal_period(options.get_lock_ttl())?)
        } else {
            None
        };

        let Some(lock) = self
            .locks
            .try_acquire(job.name(), options.get_lock_ttl())
            .await?
        else {
            tracing::debug!("Lock is held elsewhere; skipping job");
            return Ok(Dispatch::Contended);
        };

        let run = job.run(self.state.clone());
        let run_id = run.id();
        tracing::Span::current().record("run.id", tracing::field::display(run_id));

        let canceller = run.canceller();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, canceller.clone());

        // Shutdown may have snapshotted in-flight runs before this one.
        if self.shutdown_token.is_cancelled() {
            canceller.cancel_all();
        }

        let heartbeat =
            renew_every.map(|every| self.spawn_heartbeat(lock.clone(), every, canceller.clone()));

        let mut settled = Box::pin(
            settle(
                run,
                lock,
                self.locks.clone(),
                heartbeat,
                self.in_flight.clone(),
            )
            .in_current_span(),
        );

        if !options.waits_for_completion() {
            self.tracker.spawn(settled);
            return Ok(Dispatch::Detached(run_id));
        }

        tokio::select! {
            result = &mut settled => Ok(Dispatch::Completed(result)),

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("Shutting down; cancelling run");
                canceller.cancel_all();
                self.tracker.spawn(settled);
                Ok(Dispatch::Detached(run_id))
            }
        }
    }

    fn check_eligibility(&self, options: &JobOptions) -> std::result::Result<(), Ineligible> {
        if options.is_dedicated() && !self.config.is_designated_node() {
            return Err(Ineligible::NotDesignatedNode);
        }

        if let Some(class) = options.get_queue_class() {
            if !self.config.serves_queue_class(class) {
                return Err(Ineligible::QueueClass(class.to_string()));
            }
        }

        Ok(())
    }

    // A job's first fire time is only recorded here, so nothing fires on the
    // tick that first sees it.
    fn due_jobs(&self, now: Timestamp) -> Vec<&Job<S>> {
        let mut next_fires = self
            .next_fires
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.registry
            .iter()
            .filter(|job| {
                let Some(&next) = next_fires.get(job.name()) else {
                    if let Some(first) = job.trigger().next_fire() {
                        next_fires.insert(job.name().to_string(), first);
                    }
                    return false;
                };

                if next > now {
                    return false;
                }

                match job.trigger().next_fire() {
                    Some(following) => next_fires.insert(job.name().to_string(), following),
                    None => next_fires.remove(job.name()),
                };

                true
            })
            .collect()
    }

    fn spawn_heartbeat(
        &self,
        lock: Lock,
        every: StdDuration,
        canceller: CancellationChannel,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let locks = self.locks.clone();

        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = stopped.cancelled() => break,

                        _ = interval.tick() => match locks.renew(&lock).await {
                            Ok(true) => tracing::trace!("Lock renewed"),
                            Ok(false) => {
                                tracing::warn!("Lock lost while running; cancelling run");
                                canceller.cancel_all();
                                break;
                            }
                            Err(err) => tracing::warn!(%err, "Failed to renew lock"),
                        },
                    }
                }
            }
            .in_current_span(),
        );

        stop
    }

    async fn drain(&self) -> Result {
        let runs = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();

        tracing::info!(runs = runs.len(), "Scheduler stopping; cancelling in-flight runs");
        for run in &runs {
            run.cancel_all();
        }

        self.tracker.close();
        let grace = self.config.shutdown_grace_duration()?;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Shutdown grace elapsed with runs still in flight"
            );
        }

        Ok(())
    }
}

/// Handle returned by [`Scheduler::start`].
#[derive(Debug)]
pub struct SchedulerHandle {
    task: JoinHandle<Result>,
    shutdown_token: CancellationToken,
}

impl SchedulerHandle {
    /// Signals the scheduler to stop and waits for it to drain.
    pub async fn shutdown(self) -> Result {
        self.shutdown_token.cancel();
        self.task.await?
    }
}

fn renewal_period(ttl: Span) -> Result<StdDuration> {
    let ttl = lock::ttl_duration(ttl)?;
    Ok((ttl / 3).max(StdDuration::from_millis(1)))
}

async fn settle<L: LockManager>(
    run: Run,
    lock: Lock,
    locks: Arc<L>,
    heartbeat: Option<CancellationToken>,
    in_flight: InFlight,
) -> job::Result<Outcome> {
    let run_id = run.id();
    let result = run.result().await;

    if let Some(heartbeat) = heartbeat {
        heartbeat.cancel();
    }

    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&run_id);

    match locks.release(&lock).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(lock.key = %lock.key(), "Lock expired before the run settled"),
        Err(err) => tracing::warn!(lock.key = %lock.key(), %err, "Failed to release lock"),
    }

    result
}
