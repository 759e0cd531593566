use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;

/// Tells whether some structure was shutdown.
///
/// This is a one-shot signal, shared by the socket and all of its tasks. After the signal fires
/// it stays fired, tasks that start waiting afterwards return right away.
#[derive(Clone, Debug, Default)]
pub(crate) struct Shutdown {
    // Wakes every task that is waiting for the signal.
    token: CancellationToken,

    // Identify if the signal was already fired, so we know which call fired it.
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new [`Shutdown`] that was not fired yet.
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Verify if it was shutdown.
    pub(crate) fn is_shut(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the signal.
    ///
    /// Only the first call fires it and returns `true`, any other call is a no-op.
    pub(crate) fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.token.cancel();
        true
    }

    /// Wait until the signal is fired.
    pub(crate) async fn wait_shutdown(&self) {
        self.token.cancelled().await
    }
}

/// Keeps track of every task spawned by a [`crate::Socket`].
///
/// Each reader, writer and accept loop is registered here for as long as it runs, and
/// [`ShutdownGroup::wait`] only returns after all of them finished. The group is a cheap handle,
/// cloning it and giving it to multiple sockets through
/// [`crate::SocketBuilder::with_shutdown_group`] makes all of them wait for each other.
#[derive(Clone, Debug, Default)]
pub struct ShutdownGroup {
    tracker: TaskTracker,
}

impl ShutdownGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether all tasks in the group finished.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every task in the group finished.
    ///
    /// Tasks can still join the group afterwards, in which case waiting again will wait for them
    /// as well.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Spawn the task and count it until it completes.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Count the future as part of the group while it is being polled by the caller.
    pub(crate) fn track<F: Future>(&self, future: F) -> TrackedFuture<F> {
        self.tracker.track_future(future)
    }
}

#[cfg(test)]
mod tests {
    use crate::shutdown::{Shutdown, ShutdownGroup};
    use std::time::Duration;

    /// A simple test verifying that the shutdown status change only after receiving a signal.
    #[tokio::test]
    async fn should_be_on_until_shutdown() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        assert!(!shutdown.is_shut());

        let shut = tokio::spawn(async move {
            assert!(waiter.trigger());
        });

        shutdown.wait_shutdown().await;

        assert!(shutdown.is_shut());
        assert!(shut.await.is_ok());
    }

    #[tokio::test]
    async fn should_fire_only_once() {
        let shutdown = Shutdown::new();

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_shut());

        // Late waiters must not block.
        let waited =
            tokio::time::timeout(Duration::from_secs(1), shutdown.wait_shutdown()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn group_waits_for_every_task() {
        let group = ShutdownGroup::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        group.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(group.len(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), group.wait()).await;
        assert!(blocked.is_err());

        assert!(tx.send(()).is_ok());
        let finished = tokio::time::timeout(Duration::from_secs(1), group.wait()).await;
        assert!(finished.is_ok());
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn group_counts_tracked_futures() {
        let group = ShutdownGroup::new();
        let tracked = group.track(async {});

        assert_eq!(group.len(), 1);
        tracked.await;
        assert!(group.is_empty());
    }
}
