//! Resumable batch synchronization.
//!
//! A [`SyncEngine`] keeps a derived target (a search index, a denormalized
//! table, a cache) in step with a source of truth. Each concrete target only
//! supplies its stages by implementing [`SyncTarget`]: `setup`,
//! `prepare_batches`, `pull`, `transform`, `push` and `delete`, plus the
//! `promote`/`discard` pair used for rebuilds. The engine owns the control
//! flow.
//!
//! # Modes
//!
//! A run is either a full rebuild or incremental:
//!
//! - **Full** runs when no watermark exists yet or when [`SyncMode::Rebuild`]
//!   is asked for. The engine discards any stale build target, sets up a
//!   fresh one named `{live}{build_suffix}`, walks the whole id range into it
//!   window by window, and only then promotes it over the live target.
//!   Readers never see a partially populated target; a failed rebuild leaves
//!   the live target untouched.
//! - **Incremental** first drains the target's
//!   [`UpdateQueue`](crate::queue::UpdateQueue), pushing or deleting exactly
//!   the queued entities and committing each window's entries once it's
//!   pushed. It then scans ids created since the watermark and appends them.
//!
//! Every window runs through [`limit_concurrency`], so a failing window never
//! stops its siblings. The watermark (`sync:{target}` in the
//! [`CheckpointStore`]) advances to the run's start time only when every
//! window succeeded; otherwise the next run replays the same work.
//!
//! Runs move through [`SyncState`]: `Idle → DrainingQueue → ScanningNewRange
//! → Done | Failed`, with full runs skipping the drain.
//!
//! # Example
//!
//! ```rust,no_run
//! use sqlx::PgPool;
//! use tickwork::{
//!     checkpoint::PgCheckpointStore,
//!     queue::PgUpdateQueue,
//!     sync::{SyncEngine, SyncMode, SyncOptions, SyncTarget},
//! };
//!
//! async fn sync_articles<T: SyncTarget>(
//!     pool: PgPool,
//!     target: T,
//! ) -> Result<(), tickwork::sync::Error> {
//!     let engine = SyncEngine::new(
//!         target,
//!         PgCheckpointStore::new(pool.clone()),
//!         PgUpdateQueue::new(pool),
//!     )
//!     .with_options(SyncOptions::new().parallelism(4));
//!
//!     let report = engine.run(SyncMode::Auto).await?;
//!     tracing::info!(pushed = report.pushed, "Articles synced");
//!
//!     // Treat any failed window as an error.
//!     report.into_result()?;
//!
//!     Ok(())
//! }
//! ```

use std::{collections::HashSet, fmt, future::Future, sync::Arc};

use jiff::Timestamp;
use tracing::instrument;

use crate::{
    checkpoint::{self, CheckpointStore},
    executor::{self, limit_concurrency},
    queue::{self, collapse, EntityId, EntryId, PendingChange, SyncAction, UpdateQueue},
};

/// A type alias for sync results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Sync errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Checkpoint store error.
    #[error(transparent)]
    Checkpoint(#[from] checkpoint::Error),

    /// Update queue error.
    #[error(transparent)]
    Queue(#[from] queue::Error),

    /// A target stage failed.
    #[error("Sync stage `{stage}` failed: {message}")]
    Stage {
        /// The failing stage.
        stage: Stage,

        /// What went wrong.
        message: String,
    },

    /// Some windows failed.
    #[error("{failed} of {total} sync windows failed")]
    Incomplete {
        /// Failed windows.
        failed: usize,

        /// All windows.
        total: usize,
    },
}

impl Error {
    /// Creates an [`Error::Stage`].
    pub fn stage(stage: Stage, message: impl fmt::Display) -> Self {
        Self::Stage {
            stage,
            message: message.to_string(),
        }
    }
}

/// Target stages, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// [`SyncTarget::setup`].
    Setup,
    /// [`SyncTarget::prepare_batches`].
    Prepare,
    /// [`SyncTarget::pull`].
    Pull,
    /// [`SyncTarget::transform`].
    Transform,
    /// [`SyncTarget::push`].
    Push,
    /// [`SyncTarget::delete`].
    Delete,
    /// [`SyncTarget::promote`].
    Promote,
    /// [`SyncTarget::discard`].
    Discard,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Setup => "setup",
            Self::Prepare => "prepare",
            Self::Pull => "pull",
            Self::Transform => "transform",
            Self::Push => "push",
            Self::Delete => "delete",
            Self::Promote => "promote",
            Self::Discard => "discard",
        };
        f.write_str(stage)
    }
}

/// A bounded unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncBatch {
    /// Every entity with an id in `start_id..=end_id`.
    New {
        /// First id, inclusive.
        start_id: EntityId,
        /// Last id, inclusive.
        end_id: EntityId,
    },

    /// Re-pull and upsert these entities.
    Update {
        /// Entity ids.
        ids: Vec<EntityId>,
    },

    /// Remove these entities from the target.
    Delete {
        /// Entity ids.
        ids: Vec<EntityId>,
    },
}

impl fmt::Display for SyncBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New { start_id, end_id } => write!(f, "new[{start_id}..={end_id}]"),
            Self::Update { ids } => write!(f, "update({} ids)", ids.len()),
            Self::Delete { ids } => write!(f, "delete({} ids)", ids.len()),
        }
    }
}

/// The id range a scan walks, and its window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// First id, inclusive.
    pub start_id: EntityId,

    /// Last id, inclusive.
    pub end_id: EntityId,

    /// Ids per window. Zero is treated as one.
    pub batch_size: u64,
}

impl BatchPlan {
    /// Creates a plan.
    pub fn new(start_id: EntityId, end_id: EntityId, batch_size: u64) -> Self {
        Self {
            start_id,
            end_id,
            batch_size,
        }
    }

    /// A plan with nothing to scan.
    pub fn empty() -> Self {
        Self::new(1, 0, 1)
    }

    /// Returns `true` if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.start_id > self.end_id
    }

    /// The plan's windows, in id order.
    pub fn windows(&self) -> Windows {
        Windows {
            next: (!self.is_empty()).then_some(self.start_id),
            end_id: self.end_id,
            size: self.batch_size.clamp(1, i64::MAX as u64) as i64,
        }
    }
}

/// Iterator over a [`BatchPlan`]'s windows.
#[derive(Debug, Clone)]
pub struct Windows {
    next: Option<EntityId>,
    end_id: EntityId,
    size: i64,
}

impl Iterator for Windows {
    type Item = SyncBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let start_id = self.next?;
        let end_id = start_id.saturating_add(self.size - 1).min(self.end_id);
        self.next = (end_id < self.end_id).then(|| end_id + 1);
        Some(SyncBatch::New { start_id, end_id })
    }
}

/// Live and building names during a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSwap {
    /// The target readers use.
    pub live: String,

    /// The target being populated.
    pub building: String,
}

/// The stages of one sync target.
///
/// Methods taking a `target` name act on that physical target: the live one
/// for incremental runs, the build one during rebuilds. All of them must be
/// safe to repeat: `setup` creates if missing, `push` upserts and `delete`
/// ignores missing ids.
pub trait SyncTarget: Send + Sync + 'static {
    /// Rows as pulled from the source.
    type Raw: Send + 'static;

    /// Records as pushed to the target.
    type Record: Send + 'static;

    /// The live target's name. Also keys the watermark and update queue.
    fn name(&self) -> &str;

    /// Primary id of a pulled row.
    fn raw_id(raw: &Self::Raw) -> EntityId;

    /// Creates `target` if missing, or reconciles it if present.
    fn setup(&self, target: &str) -> impl Future<Output = Result> + Send;

    /// The id range to scan: everything when `last_synced_at` is `None`,
    /// otherwise only what was created after it.
    fn prepare_batches(
        &self,
        last_synced_at: Option<Timestamp>,
    ) -> impl Future<Output = Result<BatchPlan>> + Send;

    /// Pulls the rows a batch covers.
    ///
    /// Entities that are no longer eligible for the target are left out;
    /// for update batches the engine deletes them from the target.
    fn pull(&self, batch: &SyncBatch) -> impl Future<Output = Result<Vec<Self::Raw>>> + Send;

    /// Shapes pulled rows into target records.
    fn transform(
        &self,
        raw: Vec<Self::Raw>,
    ) -> impl Future<Output = Result<Vec<Self::Record>>> + Send;

    /// Upserts records into `target`.
    fn push(
        &self,
        target: &str,
        records: Vec<Self::Record>,
    ) -> impl Future<Output = Result> + Send;

    /// Removes entities from `target`.
    fn delete(&self, target: &str, ids: &[EntityId]) -> impl Future<Output = Result> + Send;

    /// Atomically makes `swap.building` the live target and drops the old
    /// live one.
    fn promote(&self, swap: &IndexSwap) -> impl Future<Output = Result> + Send;

    /// Drops `target` if it exists.
    fn discard(&self, target: &str) -> impl Future<Output = Result> + Send;
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not started.
    Idle,

    /// Processing the update queue.
    DrainingQueue,

    /// Walking an id range.
    ScanningNewRange,

    /// Every window succeeded and the watermark advanced.
    Done,

    /// A stage or window failed.
    Failed,
}

impl SyncState {
    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns `true` if a run may move from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SyncState::*;

        matches!(
            (self, next),
            (Idle, DrainingQueue)
                | (Idle, ScanningNewRange)
                | (DrainingQueue, ScanningNewRange)
                | (ScanningNewRange, Done)
                | (Idle | DrainingQueue | ScanningNewRange, Failed)
        )
    }
}

/// What a run should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Rebuild when there's no watermark, otherwise sync incrementally.
    #[default]
    Auto,

    /// Always rebuild.
    Rebuild,
}

/// Which kind of run happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Rebuild into a fresh target, then promote.
    Full,

    /// Queue drain plus new-id scan against the live target.
    Incremental,
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    parallelism: usize,
    queue_batch_size: usize,
    build_suffix: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            queue_batch_size: 1_000,
            build_suffix: "_build".to_string(),
        }
    }
}

impl SyncOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many windows run at once. Defaults to the number of CPUs.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// How many queued entities go into one window. Defaults to 1,000.
    pub fn queue_batch_size(mut self, queue_batch_size: usize) -> Self {
        self.queue_batch_size = queue_batch_size;
        self
    }

    /// Suffix of the build target's name. Defaults to `_build`.
    pub fn build_suffix(mut self, build_suffix: impl Into<String>) -> Self {
        self.build_suffix = build_suffix.into();
        self
    }
}

/// A window that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowFailure {
    /// The failing batch.
    pub batch: SyncBatch,

    /// Why it failed.
    pub error: String,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// The live target's name.
    pub target: String,

    /// Full or incremental.
    pub kind: SyncKind,

    /// Final state.
    pub state: SyncState,

    /// When the run started.
    pub started_at: Timestamp,

    /// Windows attempted.
    pub windows: usize,

    /// Rows pulled from the source.
    pub pulled: usize,

    /// Records pushed to the target.
    pub pushed: usize,

    /// Entities deleted from the target.
    pub deleted: usize,

    /// Queue entries committed.
    pub committed: u64,

    /// Whether a rebuild was promoted.
    pub promoted: bool,

    /// The watermark after the run, if it advanced.
    pub watermark: Option<Timestamp>,

    /// Windows that failed.
    pub failures: Vec<WindowFailure>,
}

impl SyncReport {
    fn new(target: &str, kind: SyncKind) -> Self {
        Self {
            target: target.to_string(),
            kind,
            state: SyncState::Idle,
            started_at: Timestamp::now(),
            windows: 0,
            pulled: 0,
            pushed: 0,
            deleted: 0,
            committed: 0,
            promoted: false,
            watermark: None,
            failures: Vec::new(),
        }
    }

    /// Returns `true` if no window failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turns failed windows into an error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(Error::Incomplete {
                failed: self.failures.len(),
                total: self.windows,
            })
        }
    }

    fn transition(&mut self, next: SyncState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid sync transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(from = ?self.state, to = ?next, "Sync state changed");
        self.state = next;
    }

    fn record(&mut self, batch: SyncBatch, outcome: executor::Result<WindowStats, Error>) {
        self.windows += 1;
        match outcome {
            Ok(stats) => {
                self.pulled += stats.pulled;
                self.pushed += stats.pushed;
                self.deleted += stats.deleted;
                self.committed += stats.committed;
            }

            Err(err) => {
                let error = err.to_string();
                tracing::error!(%batch, %error, "Sync window failed");
                self.failures.push(WindowFailure { batch, error });
            }
        }
    }
}

#[derive(Debug, Default)]
struct WindowStats {
    pulled: usize,
    pushed: usize,
    deleted: usize,
    committed: u64,
}

/// Runs syncs for one target.
#[derive(Debug)]
pub struct SyncEngine<T, C, Q> {
    target: Arc<T>,
    checkpoints: C,
    queue: Arc<Q>,
    options: SyncOptions,
}

impl<T, C, Q> SyncEngine<T, C, Q>
where
    T: SyncTarget,
    C: CheckpointStore,
    Q: UpdateQueue,
{
    /// Creates an engine with default options.
    pub fn new(target: T, checkpoints: C, queue: Q) -> Self {
        Self {
            target: Arc::new(target),
            checkpoints,
            queue: Arc::new(queue),
            options: SyncOptions::default(),
        }
    }

    /// Replaces the engine's options.
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// The target being synced.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Key of the target's watermark.
    pub fn checkpoint_key(&self) -> String {
        format!("sync:{}", self.target.name())
    }

    /// Runs one sync.
    ///
    /// Stage errors outside of windows (setup, prepare, promote, queue and
    /// checkpoint access) are returned as errors. Window failures are
    /// collected in the report instead; see [`SyncReport::into_result`].
    #[instrument(skip(self), fields(sync.target = %self.target.name()), err)]
    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport> {
        let checkpoint = self.checkpoints.checkpoint(&self.checkpoint_key()).await?;

        let kind = if mode == SyncMode::Rebuild || checkpoint.is_initial() {
            SyncKind::Full
        } else {
            SyncKind::Incremental
        };
        let mut report = SyncReport::new(self.target.name(), kind);

        let outcome = match kind {
            SyncKind::Full => self.rebuild(&mut report).await,
            SyncKind::Incremental => self.incremental(checkpoint.value(), &mut report).await,
        };

        if let Err(err) = outcome {
            report.transition(SyncState::Failed);
            return Err(err);
        }

        if !report.is_complete() {
            report.transition(SyncState::Failed);
            tracing::warn!(
                failed = report.failures.len(),
                windows = report.windows,
                "Sync incomplete; watermark not advanced"
            );
            return Ok(report);
        }

        report.watermark = Some(checkpoint.advance_to(report.started_at).await?);
        report.transition(SyncState::Done);

        tracing::info!(
            kind = ?report.kind,
            windows = report.windows,
            pushed = report.pushed,
            deleted = report.deleted,
            committed = report.committed,
            "Sync finished"
        );

        Ok(report)
    }

    async fn rebuild(&self, report: &mut SyncReport) -> Result {
        let live = self.target.name().to_string();
        let swap = IndexSwap {
            building: format!("{live}{}", self.options.build_suffix),
            live,
        };

        // Changes queued before this point are covered by the full scan.
        let pending = self.queue.pending(&swap.live).await?;

        self.target.discard(&swap.building).await?;
        self.target.setup(&swap.building).await?;
        let plan = self.target.prepare_batches(None).await?;

        report.transition(SyncState::ScanningNewRange);
        self.scan(plan, &swap.building, report).await;

        if !report.is_complete() {
            tracing::warn!(building = %swap.building, "Rebuild incomplete; live target untouched");
            return Ok(());
        }

        self.target.promote(&swap).await?;
        report.promoted = true;
        tracing::info!(live = %swap.live, building = %swap.building, "Rebuild promoted");

        let entry_ids = pending.iter().map(|entry| entry.id).collect::<Vec<_>>();
        report.committed += self.queue.commit(&swap.live, &entry_ids).await?;

        Ok(())
    }

    async fn incremental(&self, since: Timestamp, report: &mut SyncReport) -> Result {
        let live = self.target.name().to_string();
        self.target.setup(&live).await?;

        report.transition(SyncState::DrainingQueue);
        self.drain(&live, report).await?;

        report.transition(SyncState::ScanningNewRange);
        let plan = self.target.prepare_batches(Some(since)).await?;
        self.scan(plan, &live, report).await;

        Ok(())
    }

    async fn drain(&self, live: &str, report: &mut SyncReport) -> Result {
        let entries = self.queue.pending(live).await?;
        let windows = queue_windows(&collapse(&entries), self.options.queue_batch_size);
        let batches = windows
            .iter()
            .map(|(batch, _)| batch.clone())
            .collect::<Vec<_>>();

        let index: Arc<str> = Arc::from(live);
        let tasks = windows.into_iter().map(|(batch, entry_ids)| {
            let target = self.target.clone();
            let queue = self.queue.clone();
            let index = index.clone();
            move || async move {
                let mut stats = sync_window(&*target, &index, &batch).await?;
                stats.committed = queue.commit(&index, &entry_ids).await?;
                Ok::<_, Error>(stats)
            }
        });

        let outcomes = limit_concurrency(tasks, self.options.parallelism).await;
        for (batch, outcome) in batches.into_iter().zip(outcomes) {
            report.record(batch, outcome);
        }

        Ok(())
    }

    async fn scan(&self, plan: BatchPlan, index: &str, report: &mut SyncReport) {
        let batches = plan.windows().collect::<Vec<_>>();

        let index: Arc<str> = Arc::from(index);
        let tasks = batches.clone().into_iter().map(|batch| {
            let target = self.target.clone();
            let index = index.clone();
            move || async move { sync_window(&*target, &index, &batch).await }
        });

        let outcomes = limit_concurrency(tasks, self.options.parallelism).await;
        for (batch, outcome) in batches.into_iter().zip(outcomes) {
            report.record(batch, outcome);
        }
    }
}

// One window per batch, each carrying the queue entries it consumes.
fn queue_windows(changes: &[PendingChange], size: usize) -> Vec<(SyncBatch, Vec<EntryId>)> {
    let (updates, deletes): (Vec<_>, Vec<_>) = changes
        .iter()
        .partition(|change| change.action == SyncAction::Update);

    let window = |changes: &[&PendingChange], make: fn(Vec<EntityId>) -> SyncBatch| {
        let ids: Vec<EntityId> = changes.iter().map(|change| change.entity_id).collect();
        let entry_ids: Vec<EntryId> = changes
            .iter()
            .flat_map(|change| change.entry_ids.iter().copied())
            .collect();
        (make(ids), entry_ids)
    };

    let size = size.max(1);
    updates
        .chunks(size)
        .map(|chunk| window(chunk, |ids| SyncBatch::Update { ids }))
        .chain(
            deletes
                .chunks(size)
                .map(|chunk| window(chunk, |ids| SyncBatch::Delete { ids })),
        )
        .collect()
}

async fn sync_window<T: SyncTarget>(
    target: &T,
    index: &str,
    batch: &SyncBatch,
) -> Result<WindowStats> {
    let mut stats = WindowStats::default();

    match batch {
        SyncBatch::Delete { ids } => {
            if !ids.is_empty() {
                target.delete(index, ids).await?;
                stats.deleted = ids.len();
            }
        }

        SyncBatch::New { .. } | SyncBatch::Update { .. } => {
            let raw = target.pull(batch).await?;
            stats.pulled = raw.len();

            // Queued entities the source no longer returns have become
            // ineligible.
            let missing = match batch {
                SyncBatch::Update { ids } => {
                    let found = raw.iter().map(T::raw_id).collect::<HashSet<_>>();
                    ids.iter()
                        .copied()
                        .filter(|id| !found.contains(id))
                        .collect()
                }
                _ => Vec::new(),
            };

            if !raw.is_empty() {
                let records = target.transform(raw).await?;
                stats.pushed = records.len();
                if !records.is_empty() {
                    target.push(index, records).await?;
                }
            }

            if !missing.is_empty() {
                target.delete(index, &missing).await?;
                stats.deleted = missing.len();
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use jiff::ToSpan;

    use super::*;
    use crate::{checkpoint::MemoryCheckpointStore, queue::MemoryUpdateQueue};

    #[derive(Debug, Clone)]
    struct Article {
        id: i64,
        title: String,
        visible: bool,
        created_at: Timestamp,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        id: i64,
        title: String,
    }

    type Index = BTreeMap<i64, Doc>;

    // An in-memory search service indexing articles.
    struct Search {
        batch_size: u64,
        articles: Mutex<BTreeMap<i64, Article>>,
        indexes: Mutex<HashMap<String, Index>>,
        pushed_ids: Mutex<Vec<i64>>,
        push_calls: AtomicUsize,
        fail_push_for: Mutex<Option<i64>>,
    }

    impl Search {
        fn with_articles(ids: impl IntoIterator<Item = i64>) -> Self {
            let created_at = Timestamp::now()
                .checked_sub(1.hour())
                .expect("in range");
            let articles = ids
                .into_iter()
                .map(|id| {
                    let article = Article {
                        id,
                        title: format!("article {id}"),
                        visible: true,
                        created_at,
                    };
                    (id, article)
                })
                .collect();

            Self {
                batch_size: 2,
                articles: Mutex::new(articles),
                indexes: Mutex::new(HashMap::new()),
                pushed_ids: Mutex::new(Vec::new()),
                push_calls: AtomicUsize::new(0),
                fail_push_for: Mutex::new(None),
            }
        }

        fn edit(&self, f: impl FnOnce(&mut BTreeMap<i64, Article>)) {
            f(&mut self.articles.lock().expect("articles lock"))
        }

        fn fail_push_for(&self, id: Option<i64>) {
            *self.fail_push_for.lock().expect("failure lock") = id;
        }

        fn index(&self, name: &str) -> Option<Index> {
            self.indexes.lock().expect("indexes lock").get(name).cloned()
        }

        fn live_ids(&self) -> Vec<i64> {
            self.index("articles")
                .map(|index| index.into_keys().collect())
                .unwrap_or_default()
        }

        fn take_pushed_ids(&self) -> Vec<i64> {
            let mut ids = std::mem::take(&mut *self.pushed_ids.lock().expect("pushed lock"));
            ids.sort_unstable();
            ids
        }

        fn push_calls(&self) -> usize {
            self.push_calls.load(Ordering::SeqCst)
        }
    }

    impl SyncTarget for Search {
        type Raw = Article;
        type Record = Doc;

        fn name(&self) -> &str {
            "articles"
        }

        fn raw_id(raw: &Article) -> EntityId {
            raw.id
        }

        async fn setup(&self, target: &str) -> Result {
            let mut indexes = self.indexes.lock().expect("indexes lock");
            indexes.entry(target.to_string()).or_default();
            Ok(())
        }

        async fn prepare_batches(&self, last_synced_at: Option<Timestamp>) -> Result<BatchPlan> {
            let articles = self.articles.lock().expect("articles lock");
            let ids = articles
                .values()
                .filter(|article| last_synced_at.map_or(true, |at| article.created_at > at))
                .map(|article| article.id)
                .collect::<Vec<_>>();

            Ok(match (ids.iter().min(), ids.iter().max()) {
                (Some(&start_id), Some(&end_id)) => {
                    BatchPlan::new(start_id, end_id, self.batch_size)
                }
                _ => BatchPlan::empty(),
            })
        }

        async fn pull(&self, batch: &SyncBatch) -> Result<Vec<Article>> {
            let articles = self.articles.lock().expect("articles lock");
            let pulled = match batch {
                SyncBatch::New { start_id, end_id } => articles
                    .range(start_id..=end_id)
                    .map(|(_, article)| article.clone())
                    .collect::<Vec<_>>(),
                SyncBatch::Update { ids } => ids
                    .iter()
                    .filter_map(|id| articles.get(id).cloned())
                    .collect(),
                SyncBatch::Delete { .. } => Vec::new(),
            };

            Ok(pulled
                .into_iter()
                .filter(|article| article.visible)
                .collect())
        }

        async fn transform(&self, raw: Vec<Article>) -> Result<Vec<Doc>> {
            Ok(raw
                .into_iter()
                .map(|article| Doc {
                    id: article.id,
                    title: article.title.to_uppercase(),
                })
                .collect())
        }

        async fn push(&self, target: &str, records: Vec<Doc>) -> Result {
            let fail_for = *self.fail_push_for.lock().expect("failure lock");
            if records.iter().any(|doc| Some(doc.id) == fail_for) {
                return Err(Error::stage(Stage::Push, "search unavailable"));
            }

            let mut indexes = self.indexes.lock().expect("indexes lock");
            let index = indexes
                .get_mut(target)
                .ok_or_else(|| Error::stage(Stage::Push, format!("no index `{target}`")))?;

            self.push_calls.fetch_add(1, Ordering::SeqCst);
            let mut pushed_ids = self.pushed_ids.lock().expect("pushed lock");
            for doc in records {
                pushed_ids.push(doc.id);
                index.insert(doc.id, doc);
            }

            Ok(())
        }

        async fn delete(&self, target: &str, ids: &[EntityId]) -> Result {
            let mut indexes = self.indexes.lock().expect("indexes lock");
            if let Some(index) = indexes.get_mut(target) {
                for id in ids {
                    index.remove(id);
                }
            }
            Ok(())
        }

        async fn promote(&self, swap: &IndexSwap) -> Result {
            let mut indexes = self.indexes.lock().expect("indexes lock");
            let built = indexes
                .remove(&swap.building)
                .ok_or_else(|| Error::stage(Stage::Promote, "nothing built"))?;
            indexes.insert(swap.live.clone(), built);
            Ok(())
        }

        async fn discard(&self, target: &str) -> Result {
            self.indexes.lock().expect("indexes lock").remove(target);
            Ok(())
        }
    }

    struct Harness {
        engine: SyncEngine<Search, MemoryCheckpointStore, MemoryUpdateQueue>,
        checkpoints: MemoryCheckpointStore,
        queue: MemoryUpdateQueue,
    }

    impl Harness {
        fn new(search: Search) -> Self {
            let checkpoints = MemoryCheckpointStore::new();
            let queue = MemoryUpdateQueue::new();
            let engine = SyncEngine::new(search, checkpoints.clone(), queue.clone())
                .with_options(SyncOptions::new().parallelism(2).queue_batch_size(2));

            Self {
                engine,
                checkpoints,
                queue,
            }
        }

        fn search(&self) -> &Search {
            self.engine.target()
        }

        async fn enqueue(&self, ids: &[i64], action: SyncAction) {
            for &id in ids {
                self.queue
                    .enqueue("articles", id, action)
                    .await
                    .expect("enqueue");
            }
        }

        async fn pending_ids(&self) -> Vec<i64> {
            self.queue
                .pending("articles")
                .await
                .expect("pending")
                .into_iter()
                .map(|entry| entry.entity_id)
                .collect()
        }

        async fn watermark(&self) -> Option<Timestamp> {
            self.checkpoints
                .load("sync:articles")
                .await
                .expect("load watermark")
        }
    }

    #[tokio::test]
    async fn first_run_rebuilds_and_promotes() -> Result {
        let harness = Harness::new(Search::with_articles(1..=5));
        harness.search().edit(|articles| {
            if let Some(article) = articles.get_mut(&3) {
                article.visible = false;
            }
        });

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.kind, SyncKind::Full);
        assert_eq!(report.state, SyncState::Done);
        assert!(report.promoted);
        assert_eq!(report.windows, 3);
        assert_eq!(report.pushed, 4);
        assert_eq!(harness.search().live_ids(), vec![1, 2, 4, 5]);
        assert!(harness.search().index("articles_build").is_none());

        assert_eq!(report.watermark, Some(report.started_at));
        assert_eq!(harness.watermark().await, Some(report.started_at));

        Ok(())
    }

    #[tokio::test]
    async fn drains_distinct_queued_ids() -> Result {
        let harness = Harness::new(Search::with_articles(1..=12));
        harness.engine.run(SyncMode::Auto).await?;
        harness.search().take_pushed_ids();

        harness.enqueue(&[5, 9, 9, 12], SyncAction::Update).await;
        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.kind, SyncKind::Incremental);
        assert_eq!(report.state, SyncState::Done);
        assert_eq!(harness.search().take_pushed_ids(), vec![5, 9, 12]);
        assert_eq!(report.committed, 4);
        assert!(harness.pending_ids().await.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn second_drain_pushes_nothing() -> Result {
        let harness = Harness::new(Search::with_articles(1..=6));
        harness.engine.run(SyncMode::Auto).await?;

        harness.enqueue(&[2, 4], SyncAction::Update).await;
        harness.engine.run(SyncMode::Auto).await?;
        let calls = harness.search().push_calls();

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.pushed, 0);
        assert_eq!(report.windows, 0);
        assert_eq!(harness.search().push_calls(), calls);

        Ok(())
    }

    #[tokio::test]
    async fn deletes_and_ineligible_entities_leave_the_target() -> Result {
        let harness = Harness::new(Search::with_articles(1..=5));
        harness.engine.run(SyncMode::Auto).await?;

        // Article 2 gets hidden by moderation; article 4 is deleted.
        harness.search().edit(|articles| {
            if let Some(article) = articles.get_mut(&2) {
                article.visible = false;
            }
            articles.remove(&4);
        });
        harness.enqueue(&[2], SyncAction::Update).await;
        harness.enqueue(&[4], SyncAction::Delete).await;

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.deleted, 2);
        assert_eq!(harness.search().live_ids(), vec![1, 3, 5]);
        assert!(harness.pending_ids().await.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_live_target_intact() -> Result {
        let harness = Harness::new(Search::with_articles(1..=5));
        let first = harness.engine.run(SyncMode::Auto).await?;
        let live_before = harness.search().index("articles");

        harness.search().edit(|articles| {
            if let Some(article) = articles.get_mut(&1) {
                article.title = "retitled".to_string();
            }
        });
        harness.search().fail_push_for(Some(4));

        let failed = harness.engine.run(SyncMode::Rebuild).await?;

        assert_eq!(failed.kind, SyncKind::Full);
        assert_eq!(failed.state, SyncState::Failed);
        assert!(!failed.promoted);
        assert_eq!(failed.failures.len(), 1);
        assert_eq!(
            failed.failures[0].batch,
            SyncBatch::New {
                start_id: 3,
                end_id: 4
            }
        );
        assert_eq!(harness.search().index("articles"), live_before);
        assert_eq!(harness.watermark().await, first.watermark);
        assert!(failed.into_result().is_err());

        // The retry discards the stale build and promotes a complete one.
        harness.search().fail_push_for(None);
        let retried = harness.engine.run(SyncMode::Rebuild).await?;

        assert!(retried.promoted);
        assert!(harness.search().index("articles_build").is_none());
        let live = harness.search().index("articles").expect("live index");
        assert_eq!(live.len(), 5);
        assert_eq!(live[&1].title, "RETITLED");

        Ok(())
    }

    #[tokio::test]
    async fn failed_window_keeps_its_queue_entries() -> Result {
        let harness = Harness::new(Search::with_articles(1..=6));
        let first = harness.engine.run(SyncMode::Auto).await?;

        harness.enqueue(&[1, 2, 4, 5], SyncAction::Update).await;
        harness.search().fail_push_for(Some(4));

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.state, SyncState::Failed);
        assert_eq!(report.windows, 2);
        assert_eq!(report.committed, 2);
        assert_eq!(harness.pending_ids().await, vec![4, 5]);
        assert_eq!(harness.watermark().await, first.watermark);

        let err = report.into_result().expect_err("one window failed");
        assert!(matches!(err, Error::Incomplete { failed: 1, total: 2 }));

        // The next run replays the uncommitted window.
        harness.search().fail_push_for(None);
        harness.search().take_pushed_ids();
        harness.engine.run(SyncMode::Auto).await?.into_result()?;
        assert_eq!(harness.search().take_pushed_ids(), vec![4, 5]);
        assert!(harness.pending_ids().await.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn new_rows_are_appended_incrementally() -> Result {
        let harness = Harness::new(Search::with_articles(1..=3));
        harness.engine.run(SyncMode::Auto).await?;
        harness.search().take_pushed_ids();

        harness.search().edit(|articles| {
            articles.insert(
                4,
                Article {
                    id: 4,
                    title: "fresh".to_string(),
                    visible: true,
                    created_at: Timestamp::now(),
                },
            );
        });

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.kind, SyncKind::Incremental);
        assert_eq!(harness.search().take_pushed_ids(), vec![4]);
        assert_eq!(harness.search().live_ids(), vec![1, 2, 3, 4]);

        Ok(())
    }

    #[tokio::test]
    async fn empty_windows_are_skipped() -> Result {
        let harness = Harness::new(Search::with_articles([1, 2, 7, 8]));

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.windows, 4);
        assert_eq!(report.state, SyncState::Done);
        assert_eq!(harness.search().push_calls(), 2);
        assert_eq!(harness.search().live_ids(), vec![1, 2, 7, 8]);

        Ok(())
    }

    #[tokio::test]
    async fn rebuild_commits_entries_queued_before_it_started() -> Result {
        let harness = Harness::new(Search::with_articles(1..=3));
        harness.enqueue(&[2], SyncAction::Update).await;

        let report = harness.engine.run(SyncMode::Auto).await?;

        assert_eq!(report.kind, SyncKind::Full);
        assert_eq!(report.committed, 1);
        assert!(harness.pending_ids().await.is_empty());

        Ok(())
    }

    #[test]
    fn plan_windows() {
        let windows = BatchPlan::new(1, 5, 2).windows().collect::<Vec<_>>();
        assert_eq!(
            windows,
            vec![
                SyncBatch::New {
                    start_id: 1,
                    end_id: 2
                },
                SyncBatch::New {
                    start_id: 3,
                    end_id: 4
                },
                SyncBatch::New {
                    start_id: 5,
                    end_id: 5
                },
            ]
        );

        assert_eq!(BatchPlan::empty().windows().count(), 0);
        assert_eq!(BatchPlan::new(10, 12, 0).windows().count(), 3);
        assert_eq!(BatchPlan::new(1, i64::MAX, u64::MAX).windows().count(), 1);
    }

    #[test]
    fn queue_windows_split_by_action() {
        let change = |entity_id, action, entry_ids: &[EntryId]| PendingChange {
            entity_id,
            action,
            entry_ids: entry_ids.to_vec(),
        };

        let windows = queue_windows(
            &[
                change(1, SyncAction::Update, &[1]),
                change(2, SyncAction::Delete, &[2]),
                change(3, SyncAction::Update, &[3, 5]),
                change(4, SyncAction::Update, &[4]),
            ],
            2,
        );

        assert_eq!(
            windows,
            vec![
                (SyncBatch::Update { ids: vec![1, 3] }, vec![1, 3, 5]),
                (SyncBatch::Update { ids: vec![4] }, vec![4]),
                (SyncBatch::Delete { ids: vec![2] }, vec![2]),
            ]
        );
    }

    #[test]
    fn state_transitions() {
        use SyncState::*;

        assert!(Idle.can_transition_to(DrainingQueue));
        assert!(Idle.can_transition_to(ScanningNewRange));
        assert!(DrainingQueue.can_transition_to(ScanningNewRange));
        assert!(ScanningNewRange.can_transition_to(Done));
        assert!(DrainingQueue.can_transition_to(Failed));

        assert!(!DrainingQueue.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
        assert!(!ScanningNewRange.can_transition_to(DrainingQueue));
        assert!(Done.is_terminal() && Failed.is_terminal());
    }
}
