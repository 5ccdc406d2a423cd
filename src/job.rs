//! Jobs are named units of schedulable work.
//!
//! A [`Job`] pairs a unique name and a [`Trigger`] with an async body and
//! [`JobOptions`]. Jobs are built once at startup, collected into a
//! [`JobRegistry`](crate::JobRegistry), and never mutated afterwards.
//!
//! # Defining jobs
//!
//! ```rust
//! use jiff::ToSpan;
//! use tickwork::Job;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rollup = Job::builder()
//!     .name("metrics-rollup")
//!     .trigger("*/5 * * * *".parse()?)
//!     .body(|cx: tickwork::job::Context<()>| async move {
//!         tracing::info!(run.id = %cx.run_id, "Rolling up metrics");
//!         Ok(())
//!     })
//!     .lock_ttl(30.minutes())
//!     .build();
//!
//! assert_eq!(rollup.name(), "metrics-rollup");
//! # Ok(())
//! # }
//! ```
//!
//! # Running jobs
//!
//! [`Job::run`] spawns the body and returns a [`Run`] handle. The handle can
//! [`cancel`](Run::cancel) the run, which fans out to the callbacks the body
//! registered through its [`Context`], and resolve the run's
//! [`result`](Run::result).
//!
//! Cancelling never settles the result by itself. The body decides how to
//! react, usually by returning early from a loop that checks
//! [`Context::check_if_cancelled`]:
//!
//! ```rust
//! use tickwork::{job::Context, Job};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sweep = Job::new(
//!     "moderation-sweep",
//!     "@never".parse()?,
//!     Default::default(),
//!     |cx: Context<()>| async move {
//!         cx.on_cancel(|| async {
//!             tracing::warn!("Sweep interrupted");
//!         });
//!
//!         loop {
//!             cx.check_if_cancelled()?;
//!             tokio::task::yield_now().await;
//!         }
//!     },
//! );
//!
//! let run = sweep.run(());
//! run.cancel();
//! assert!(run.result().await.is_err());
//! # Ok(())
//! # }
//! ```
//!
//! A job may be run any number of times, concurrently or not. Exclusion
//! across processes is the [`Scheduler`](crate::Scheduler)'s concern, via its
//! [`LockManager`](crate::LockManager).

use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    time::Duration as StdDuration,
};

use jiff::{Span, Timestamp, ToSpan};
use tokio::{
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::Instrument;
use ulid::Ulid;
use uuid::Uuid;

pub use self::trigger::{Trigger, TriggerError, ZonedSchedule, NEVER};
use crate::{
    cancel::{CancellationChannel, Cancelled},
    checkpoint, executor, lock, queue, sync,
};

mod trigger;

/// A type alias for job results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Identifies a single run of a job.
pub type RunId = Uuid;

/// Job errors.
///
/// Bodies return this type, so it carries the errors of every building
/// block a body typically uses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// Checkpoint store error.
    #[error(transparent)]
    Checkpoint(#[from] checkpoint::Error),

    /// Lock manager error.
    #[error(transparent)]
    Lock(#[from] lock::Error),

    /// Update queue error.
    #[error(transparent)]
    Queue(#[from] queue::Error),

    /// Sync engine error.
    #[error(transparent)]
    Sync(#[from] sync::Error),

    /// The body observed its cancellation and stopped.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// The body failed for a reason of its own.
    #[error("{0}")]
    Failed(String),

    /// The body panicked or its runtime shut down.
    #[error("Job body did not run to completion: {0}")]
    Join(#[from] JoinError),
}

impl Error {
    /// Creates a [`Error::Failed`] from any message.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl<E: fmt::Display> From<executor::TaskError<E>> for Error {
    fn from(err: executor::TaskError<E>) -> Self {
        match err {
            executor::TaskError::Failed(err) => Self::failed(err),
            executor::TaskError::Join(err) => Self::Join(err),
        }
    }
}

/// How a job is scheduled and locked.
///
/// # Example
///
/// ```rust
/// use jiff::ToSpan;
/// use tickwork::JobOptions;
///
/// let options = JobOptions::new()
///     .lock_ttl(4.hours())
///     .wait_for_completion(false)
///     .queue_class("heavy");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub(crate) lock_ttl: Span,
    pub(crate) wait_for_completion: bool,
    pub(crate) dedicated: bool,
    pub(crate) queue_class: Option<String>,
    pub(crate) renew_lock: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            lock_ttl: 5.minutes(),
            wait_for_completion: true,
            dedicated: false,
            queue_class: None,
            renew_lock: false,
        }
    }
}

impl JobOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long the job's lock survives without being released.
    ///
    /// This should exceed the body's expected runtime. Defaults to five
    /// minutes.
    pub fn lock_ttl(mut self, lock_ttl: Span) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Sets whether the scheduler awaits the run before moving on.
    ///
    /// When `false`, the run is detached and its lock is released once it
    /// settles. Defaults to `true`.
    pub fn wait_for_completion(mut self, wait_for_completion: bool) -> Self {
        self.wait_for_completion = wait_for_completion;
        self
    }

    /// Pins the job to the designated node.
    pub fn dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }

    /// Restricts the job to nodes serving `queue_class`.
    pub fn queue_class(mut self, queue_class: impl Into<String>) -> Self {
        self.queue_class = Some(queue_class.into());
        self
    }

    /// Renews the lock in the background while the run is in flight.
    ///
    /// If a renewal finds the lock lost, the run is cancelled.
    pub fn renew_lock(mut self, renew_lock: bool) -> Self {
        self.renew_lock = renew_lock;
        self
    }

    /// The lock TTL.
    pub fn get_lock_ttl(&self) -> Span {
        self.lock_ttl
    }

    /// Whether the scheduler awaits runs.
    pub fn waits_for_completion(&self) -> bool {
        self.wait_for_completion
    }

    /// Whether the job is pinned to the designated node.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// The job's queue class, if any.
    pub fn get_queue_class(&self) -> Option<&str> {
        self.queue_class.as_deref()
    }

    /// Whether the lock is renewed while running.
    pub fn renews_lock(&self) -> bool {
        self.renew_lock
    }
}

/// What a job body receives.
pub struct Context<S> {
    /// Shared application state.
    pub state: S,

    /// Name of the running job.
    pub job_name: String,

    /// Id of this run.
    pub run_id: RunId,

    cancellation: CancellationChannel,
}

impl<S> Context<S> {
    /// Registers a cleanup callback for when the run is cancelled.
    pub fn on_cancel<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancellation.on_cancel(callback)
    }

    /// Returns `Err(Cancelled)` once the run has been cancelled.
    pub fn check_if_cancelled(&self) -> std::result::Result<(), Cancelled> {
        self.cancellation.check_if_cancelled()
    }

    /// Returns `true` once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Waits until the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

impl<S: fmt::Debug> fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("job_name", &self.job_name)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

type JobBody<S> =
    Arc<dyn Fn(Context<S>) -> Pin<Box<dyn Future<Output = Result> + Send>> + Send + Sync>;

/// A named, triggered unit of work.
pub struct Job<S> {
    name: String,
    trigger: Arc<Trigger>,
    options: JobOptions,
    body: JobBody<S>,
}

impl<S> Clone for Job<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            trigger: self.trigger.clone(),
            options: self.options.clone(),
            body: self.body.clone(),
        }
    }
}

impl<S> fmt::Debug for Job<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("trigger", &self.trigger.to_string())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S> Job<S> {
    /// The job's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the job fires.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// The job's options.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }
}

impl<S> Job<S>
where
    S: Send + 'static,
{
    /// Creates a job from its parts.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        trigger: Trigger,
        options: JobOptions,
        body: F,
    ) -> Self
    where
        F: Fn(Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result> + Send + 'static,
    {
        Self {
            name: name.into(),
            trigger: Arc::new(trigger),
            options,
            body: Arc::new(move |cx| Box::pin(body(cx))),
        }
    }

    /// Creates a builder for a job.
    pub fn builder() -> Builder<S, Initial> {
        Builder::new()
    }

    /// Spawns the body onto the current Tokio runtime.
    pub fn run(&self, state: S) -> Run {
        let run_id: RunId = Ulid::new().into();
        let cancellation = CancellationChannel::new();

        let cx = Context {
            state,
            job_name: self.name.clone(),
            run_id,
            cancellation: cancellation.clone(),
        };

        let span = tracing::info_span!("job.run", job.name = %self.name, run.id = %run_id);
        let body = self.body.clone();
        let completion = cancellation.clone();
        let handle = tokio::spawn(
            async move {
                tracing::debug!("Job run started");
                let result = body(cx).await;
                completion.complete();
                result
            }
            .instrument(span),
        );

        Run {
            id: run_id,
            job_name: self.name.clone(),
            started_at: Timestamp::now(),
            started: Instant::now(),
            cancellation,
            handle,
        }
    }
}

/// How a run settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// The run's id.
    pub run_id: RunId,

    /// The job's name.
    pub job_name: String,

    /// When the run started.
    pub started_at: Timestamp,

    /// How long the run took.
    pub elapsed: StdDuration,

    /// Whether the run was cancelled while in flight.
    pub cancelled: bool,
}

/// Handle to an in-flight run.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    job_name: String,
    started_at: Timestamp,
    started: Instant,
    cancellation: CancellationChannel,
    handle: JoinHandle<Result>,
}

impl Run {
    /// The run's id.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// The job's name.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// When the run started.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Fires the run's cancellation callbacks.
    ///
    /// Returns how many callbacks were fired. Does nothing once the run has
    /// settled or after the first call.
    pub fn cancel(&self) -> usize {
        self.cancellation.cancel_all()
    }

    /// A handle that cancels this run from elsewhere.
    pub fn canceller(&self) -> CancellationChannel {
        self.cancellation.clone()
    }

    /// Returns `true` once the body has settled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run to settle.
    ///
    /// Body errors, including panics, are returned as-is and logged along
    /// with the job name and elapsed time.
    pub async fn result(self) -> Result<Outcome> {
        let joined = self.handle.await;
        self.cancellation.complete();

        let elapsed = self.started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        let cancelled = self.cancellation.is_cancelled();

        match joined.map_err(Error::from).and_then(|result| result) {
            Ok(()) => {
                tracing::info!(
                    job.name = %self.job_name,
                    run.id = %self.id,
                    elapsed_ms,
                    cancelled,
                    "Job run succeeded"
                );

                Ok(Outcome {
                    run_id: self.id,
                    job_name: self.job_name,
                    started_at: self.started_at,
                    elapsed,
                    cancelled,
                })
            }

            Err(err) => {
                tracing::error!(
                    job.name = %self.job_name,
                    run.id = %self.id,
                    elapsed_ms,
                    cancelled,
                    err = %err,
                    "Job run failed"
                );

                Err(err)
            }
        }
    }
}

mod builder_states {
    use std::sync::Arc;

    use super::{JobBody, Trigger};

    /// Nothing set yet.
    pub struct Initial;

    /// Name set.
    pub struct NameSet {
        pub name: String,
    }

    /// Name and trigger set.
    pub struct TriggerSet {
        pub name: String,
        pub trigger: Trigger,
    }

    /// Ready to build.
    pub struct BodySet<S> {
        pub name: String,
        pub trigger: Arc<Trigger>,
        pub body: JobBody<S>,
    }
}

pub use builder_states::{BodySet, Initial, NameSet, TriggerSet};

/// Builds a [`Job`].
///
/// Name, trigger, and body are required, in that order. Options may be set
/// at any point.
pub struct Builder<S, State> {
    state: State,
    options: JobOptions,
    _marker: PhantomData<fn() -> S>,
}

impl<S> Default for Builder<S, Initial> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Builder<S, Initial> {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            state: Initial,
            options: JobOptions::default(),
            _marker: PhantomData,
        }
    }

    /// Sets the job's unique name.
    pub fn name(self, name: impl Into<String>) -> Builder<S, NameSet> {
        Builder {
            state: NameSet { name: name.into() },
            options: self.options,
            _marker: PhantomData,
        }
    }
}

impl<S> Builder<S, NameSet> {
    /// Sets when the job fires.
    pub fn trigger(self, trigger: Trigger) -> Builder<S, TriggerSet> {
        Builder {
            state: TriggerSet {
                name: self.state.name,
                trigger,
            },
            options: self.options,
            _marker: PhantomData,
        }
    }
}

impl<S> Builder<S, TriggerSet>
where
    S: Send + 'static,
{
    /// Sets the job's body.
    pub fn body<F, Fut>(self, body: F) -> Builder<S, BodySet<S>>
    where
        F: Fn(Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result> + Send + 'static,
    {
        Builder {
            state: BodySet {
                name: self.state.name,
                trigger: Arc::new(self.state.trigger),
                body: Arc::new(move |cx| Box::pin(body(cx))),
            },
            options: self.options,
            _marker: PhantomData,
        }
    }
}

impl<S, State> Builder<S, State> {
    /// Replaces all options at once.
    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// See [`JobOptions::lock_ttl`].
    pub fn lock_ttl(mut self, lock_ttl: Span) -> Self {
        self.options.lock_ttl = lock_ttl;
        self
    }

    /// See [`JobOptions::wait_for_completion`].
    pub fn wait_for_completion(mut self, wait_for_completion: bool) -> Self {
        self.options.wait_for_completion = wait_for_completion;
        self
    }

    /// See [`JobOptions::dedicated`].
    pub fn dedicated(mut self, dedicated: bool) -> Self {
        self.options.dedicated = dedicated;
        self
    }

    /// See [`JobOptions::queue_class`].
    pub fn queue_class(mut self, queue_class: impl Into<String>) -> Self {
        self.options.queue_class = Some(queue_class.into());
        self
    }

    /// See [`JobOptions::renew_lock`].
    pub fn renew_lock(mut self, renew_lock: bool) -> Self {
        self.options.renew_lock = renew_lock;
        self
    }
}

impl<S> Builder<S, BodySet<S>> {
    /// Builds the job.
    pub fn build(self) -> Job<S> {
        let BodySet {
            name,
            trigger,
            body,
        } = self.state;

        Job {
            name,
            trigger,
            options: self.options,
            body,
        }
    }
}
