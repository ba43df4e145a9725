//! Cancellable fixed-interval tasks on the tokio runtime.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Decrements the shared live counter when the task future is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A task running `f` every `interval` after `initial_delay`.
///
/// Each iteration runs to completion; cancellation is observed only while
/// waiting between iterations. Iteration errors are logged and swallowed.
pub struct PeriodicTask {
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: &'static str,
        initial_delay: Duration,
        interval: Duration,
        live: Arc<AtomicUsize>,
        mut f: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(live);

        let handle = tokio::spawn(async move {
            let _guard = guard;

            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = cancelled.changed() => return,
            }

            loop {
                if *cancelled.borrow() {
                    break;
                }
                if let Err(e) = f().await {
                    warn!(task = name, error = %e, "Periodic task iteration failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancelled.changed() => break,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal cancellation. Returns true only if the task was still running
    /// and had not been cancelled before.
    pub fn cancel(&self) -> bool {
        let already = self.cancel.send_replace(true);
        !already && !self.handle.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}
