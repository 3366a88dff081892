//! Coordinate failure and shutdown across the dataflow's background tasks
//!
//! # Fail fast with [`FlushFailure`]
//!
//! Pipeline workers run detached from the caller feeding the pipeline. When one of them fails,
//! the error is parked in a [`FlushFailure`] latch. Only the first error is kept. The latch also
//! cancels a [`CancellationToken`] so that blocked producers and sibling workers stop at their next
//! safe point, and the ingestion side re-raises the stored error on its next call.
//!
//! # Stop periodic tasks with the [`ShutdownManager`] type
//!
//! Periodic tasks like the checkpoint reconciler [`register`][ShutdownManager::register] to receive
//! a [`ShutdownToken`]. They [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] between
//! iterations and signal back via [`complete`][ShutdownToken::complete] once the iteration in flight
//! has finished. [`join`][ShutdownManager::join] only returns after every registered task did so,
//! which means no shared state is left mid-mutation.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// A single-assignment cell holding the first error raised by any pipeline worker
///
/// Once set it is never cleared. Cloning is cheap and every clone observes the same cell.
#[derive(Debug)]
pub struct FlushFailure<E> {
    inner: Arc<FlushFailureInner<E>>,
}

#[derive(Debug)]
struct FlushFailureInner<E> {
    error: Mutex<Option<Arc<E>>>,
    token: CancellationToken,
}

impl<E> FlushFailure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlushFailureInner {
                error: Mutex::new(None),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Record `error` if no error has been recorded yet
    ///
    /// Returns `true` if this call set the latch. Later errors are logged and dropped.
    pub fn propagate(&self, error: E) -> bool {
        let mut slot = self.inner.error.lock();
        if let Some(existing) = slot.as_ref() {
            warn!(%error, first_error = %existing, "discarding error, flush failure already set");
            return false;
        }
        debug!(%error, "flush failure set");
        *slot = Some(Arc::new(error));
        drop(slot);
        self.inner.token.cancel();
        true
    }

    /// The stored error, if any
    pub fn get(&self) -> Option<Arc<E>> {
        self.inner.error.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    /// Return the stored error as `Err`, or `Ok(())` if the latch is still clear
    pub fn check(&self) -> Result<(), Arc<E>> {
        match self.get() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A token that is cancelled the moment the latch is set
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Completes once the latch has been set
    pub async fn wait_for_failure(&self) {
        self.inner.token.cancelled().await;
    }
}

impl<E> Clone for FlushFailure<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for FlushFailure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Manage shutdown of periodic background tasks
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Register a task that needs to finish its current iteration before shutdown completes
    ///
    /// Provides a [`ShutdownToken`] which the caller is responsible for handling. The caller must
    /// invoke [`complete`][ShutdownToken::complete] in order for [`join`][Self::join] to return.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.shutdown.clone(), tx)
    }

    /// Signal shutdown to every registered task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for registered tasks to signal completion
    ///
    /// A task that drops its token without calling [`complete`][ShutdownToken::complete] also
    /// counts as complete, since it can no longer be mid-iteration.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        debug!("all registered background tasks completed");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A token that a task can obtain via [`register`][ShutdownManager::register]
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that completes when the [`ShutdownManager`] that issued this token is shutdown
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Signal back to the [`ShutdownManager`] that the task owning this token has finished
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
