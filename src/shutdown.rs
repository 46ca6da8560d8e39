//! Root cancellation and task tracking: a root context
//! covers the process lifetime; `Shutdown` cancels it and waits for every
//! registered task (heartbeat, monitors, in-flight sessions) to exit.
//! `Shutdown()` is idempotent and returns only once every task it tracks
//! has finished (testable property #8).

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared shutdown coordinator. Clone freely; every clone shares the same
/// cancellation token and task set.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    tasks: std::sync::Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Construct a fresh, uncancelled shutdown coordinator.
    pub fn new() -> Self {
        Shutdown {
            token: CancellationToken::new(),
            tasks: std::sync::Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
        }
    }

    /// The cancellation token long-lived tasks should select against.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a long-lived task so `wait` can join it on shutdown.
    pub async fn track<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(fut);
    }

    /// Cancel the root token and wait for every tracked task to exit.
    /// Idempotent: calling this more than once is safe, the second call
    /// just finds the token already cancelled and the task set already
    /// drained.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    /// True once `shutdown` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_waits_for_tracked_tasks() {
        let shutdown = Shutdown::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let token = shutdown.token();
        shutdown
            .track(async move {
                token.cancelled().await;
                ran2.store(true, Ordering::SeqCst);
            })
            .await;

        shutdown.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.shutdown().await;
        shutdown.shutdown().await;
        assert!(shutdown.is_cancelled());
    }
}
