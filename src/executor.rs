//! Bounded concurrency for independent sub-work.
//!
//! Job bodies often need to issue many independent operations (per-row
//! updates, per-user notifications, per-window index pushes) without
//! overwhelming whatever sits downstream. [`limit_concurrency`] runs a list of
//! task thunks with a ceiling on how many are in flight at once.
//!
//! The window slides: as soon as one task settles, the next queued thunk is
//! invoked. A failing or panicking task never cancels its siblings; every
//! task settles exactly once and its outcome is reported in submission order.
//! There's no per-task timeout or retry. Compose those inside the thunk.
//!
//! # Example
//!
//! ```rust
//! use tickwork::executor::limit_concurrency;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let user_ids = vec![1, 2, 3, 4, 5];
//!
//! let tasks = user_ids.into_iter().map(|user_id| {
//!     move || async move {
//!         // Notify the user...
//!         Ok::<_, std::io::Error>(user_id)
//!     }
//! });
//!
//! let outcomes = limit_concurrency(tasks, 2).await;
//! assert_eq!(outcomes.len(), 5);
//! assert!(outcomes.iter().all(Result::is_ok));
//! # }
//! ```

use std::{collections::HashMap, future::Future};

use tokio::task::{JoinError, JoinSet};

/// A type alias for the outcome of a single task.
pub type Result<T, E> = std::result::Result<T, TaskError<E>>;

/// Why a task didn't produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// The task's future resolved to an error.
    #[error("{0}")]
    Failed(E),

    /// The task panicked or its runtime shut down before it settled.
    #[error("Task did not run to completion: {0}")]
    Join(JoinError),
}

impl<E> TaskError<E> {
    /// Returns the task's own error, if it returned one.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Join(_) => None,
        }
    }
}

/// Runs `tasks` with at most `max_concurrent` of them in flight.
///
/// Each thunk is only invoked once a slot is free, so no more than
/// `max_concurrent` tasks exist at any time. Outcomes are returned in the
/// order the tasks were submitted. A `max_concurrent` of zero is treated as
/// one.
///
/// Tasks are spawned onto the current Tokio runtime. Dropping the returned
/// future aborts the tasks still in flight.
pub async fn limit_concurrency<I, F, Fut, T, E>(
    tasks: I,
    max_concurrent: usize,
) -> Vec<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let max_concurrent = max_concurrent.max(1);
    let mut queued = tasks.into_iter();

    let mut in_flight = JoinSet::new();
    let mut positions = HashMap::new();
    let mut outcomes = Vec::new();

    loop {
        while in_flight.len() < max_concurrent {
            let Some(task) = queued.next() else {
                break;
            };

            let handle = in_flight.spawn(task());
            positions.insert(handle.id(), outcomes.len());
            outcomes.push(None);
        }

        let Some(joined) = in_flight.join_next_with_id().await else {
            break;
        };

        let (id, outcome) = match joined {
            Ok((id, output)) => (id, output.map_err(TaskError::Failed)),
            Err(err) => (err.id(), Err(TaskError::Join(err))),
        };

        if let Some(position) = positions.remove(&id) {
            outcomes[position] = Some(outcome);
        }
    }

    // Every spawned task is joined exactly once, so every slot is filled.
    outcomes.into_iter().flatten().collect()
}

/// Same as [`limit_concurrency`] but stops at the first failure.
///
/// Every task still settles before this returns; the error reported is the
/// first one in submission order.
pub async fn try_limit_concurrency<I, F, Fut, T, E>(
    tasks: I,
    max_concurrent: usize,
) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    limit_concurrency(tasks, max_concurrent)
        .await
        .into_iter()
        .collect()
}
