//! Cooperative cancellation for job runs.
//!
//! Every run owns a [`CancellationChannel`]. Job bodies register cleanup
//! callbacks on it with [`on_cancel`](CancellationChannel::on_cancel) and may
//! poll it from long loops with
//! [`check_if_cancelled`](CancellationChannel::check_if_cancelled).
//!
//! Cancelling a channel never aborts the body. It only fans out the registered
//! callbacks, each on its own Tokio task, and flips the flag the body can
//! observe. A body that ignores the flag simply runs to completion.
//!
//! ```rust
//! use tickwork::cancel::CancellationChannel;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let channel = CancellationChannel::new();
//!
//! channel.on_cancel(|| async {
//!     // Release external resources here.
//! });
//!
//! assert_eq!(channel.cancel_all(), 1);
//! assert!(channel.check_if_cancelled().is_err());
//! # }
//! ```

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
};

use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Returned when a cancelled run checks its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Run was cancelled")]
pub struct Cancelled;

enum Registration {
    Active(Vec<Callback>),
    Cancelled,
    Completed,
}

struct Inner {
    registration: Mutex<Registration>,
    token: CancellationToken,
}

/// Per-run registry of cancellation callbacks.
///
/// Clones share the same registration.
#[derive(Clone)]
pub struct CancellationChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationChannel")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Default for CancellationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationChannel {
    /// Creates a new, active channel.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registration: Mutex::new(Registration::Active(Vec::new())),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Registers a callback to run when the channel is cancelled.
    ///
    /// When the channel was already cancelled the callback is spawned right
    /// away. Once the run has completed, registrations are ignored.
    pub fn on_cancel<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || Box::pin(callback()));

        let late = {
            let mut registration = self.lock_registration();
            match &mut *registration {
                Registration::Active(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                Registration::Cancelled => callback,
                Registration::Completed => return,
            }
        };

        tokio::spawn(late());
    }

    /// Cancels the channel, spawning every registered callback concurrently.
    ///
    /// Returns how many callbacks were fired. Only the first call on an active
    /// channel fires anything; later calls, and calls after completion, return
    /// zero.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn cancel_all(&self) -> usize {
        let callbacks = {
            let mut registration = self.lock_registration();
            match std::mem::replace(&mut *registration, Registration::Cancelled) {
                Registration::Active(callbacks) => callbacks,
                previous => {
                    *registration = previous;
                    return 0;
                }
            }
        };

        self.inner.token.cancel();

        let fired = callbacks.len();
        for callback in callbacks {
            tokio::spawn(callback());
        }

        tracing::debug!(callbacks = fired, "Cancellation fanned out");

        fired
    }

    /// Returns `true` once [`cancel_all`](Self::cancel_all) has taken effect.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns `Err(Cancelled)` if the channel has been cancelled.
    ///
    /// Intended for long loops inside job bodies:
    ///
    /// ```rust
    /// # use tickwork::cancel::{CancellationChannel, Cancelled};
    /// # fn work(channel: &CancellationChannel) -> Result<(), Cancelled> {
    /// for _row in 0..1_000 {
    ///     channel.check_if_cancelled()?;
    ///     // ...
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn check_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Waits until the channel is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Discards the registration after the run has settled.
    ///
    /// Pending callbacks are dropped without being invoked and further
    /// cancellation becomes a no-op.
    pub(crate) fn complete(&self) {
        let mut registration = self.lock_registration();
        if matches!(*registration, Registration::Active(_)) {
            *registration = Registration::Completed;
        }
    }

    fn lock_registration(&self) -> std::sync::MutexGuard<'_, Registration> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
