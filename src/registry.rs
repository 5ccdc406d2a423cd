//! The immutable set of jobs a process schedules.
//!
//! A registry is built once at startup and handed to the
//! [`Scheduler`](crate::Scheduler). Job names are unique within it.
//!
//! ```rust
//! use tickwork::{job::Context, Job, JobOptions, JobRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let noop = |_: Context<()>| async { Ok(()) };
//!
//! let registry = JobRegistry::new([
//!     Job::new("hourly", "0 * * * *".parse()?, JobOptions::default(), noop),
//!     Job::new("backfill", "@never".parse()?, JobOptions::default(), noop),
//! ])?;
//!
//! assert!(registry.get("backfill").is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use crate::Job;

/// A type alias for registry results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Registry errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Two jobs share a name.
    #[error("Job `{0}` is registered more than once")]
    DuplicateName(String),
}

/// Jobs keyed by name, kept in registration order.
#[derive(Debug)]
pub struct JobRegistry<S> {
    jobs: Vec<Job<S>>,
    by_name: HashMap<String, usize>,
}

impl<S> JobRegistry<S> {
    /// Builds a registry, rejecting duplicate names.
    pub fn new(jobs: impl IntoIterator<Item = Job<S>>) -> Result<Self> {
        let jobs = jobs.into_iter().collect::<Vec<_>>();

        let mut by_name = HashMap::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            if by_name.insert(job.name().to_string(), index).is_some() {
                return Err(Error::DuplicateName(job.name().to_string()));
            }
        }

        Ok(Self { jobs, by_name })
    }

    /// Looks a job up by name.
    pub fn get(&self, name: &str) -> Option<&Job<S>> {
        self.by_name.get(name).map(|&index| &self.jobs[index])
    }

    /// Iterates jobs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Job<S>> {
        self.jobs.iter()
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns `true` if no jobs are registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<'a, S> IntoIterator for &'a JobRegistry<S> {
    type Item = &'a Job<S>;
    type IntoIter = std::slice::Iter<'a, Job<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.iter()
    }
}
