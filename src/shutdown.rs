//! Graceful shutdown handling for the worker.
//!
//! This module provides a `ShutdownCoordinator` that tracks the worker
//! lifecycle (`starting → running → shutting-down → terminated`), owns the
//! registry of cleanup callbacks and runs them exactly once when shutdown is
//! requested, whatever triggered it and however often.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::future::{join_all, BoxFuture};
use tokio::signal;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Running,
            2 => LifecycleState::ShuttingDown,
            _ => LifecycleState::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Starting => 0,
            LifecycleState::Running => 1,
            LifecycleState::ShuttingDown => 2,
            LifecycleState::Terminated => 3,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::ShuttingDown => write!(f, "shutting-down"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `terminate` message, interrupt signal or closed channel.
    Terminate,
    /// Uncaught failure inside the worker.
    Uncaught(String),
}

impl ShutdownReason {
    /// Process exit code for this reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Terminate => 0,
            ShutdownReason::Uncaught(_) => 1,
        }
    }
}

/// A shutdown callback.
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered, append-only list of cleanup callbacks, drained exactly once.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    callbacks: Arc<Mutex<Option<Vec<CleanupFn>>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Register a callback. Ignored once the registry has been drained.
    pub fn register<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(move || Box::pin(callback()))),
            None => warn!("Cleanup registered after shutdown; ignoring"),
        }
    }

    pub fn len(&self) -> usize {
        let guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every callback. Later calls return nothing.
    fn drain(&self) -> Vec<CleanupFn> {
        let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        guard.take().unwrap_or_default()
    }
}

/// Coordinates graceful shutdown across the worker.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<AtomicU8>,
    reason: Arc<OnceLock<ShutdownReason>>,
    notify: Arc<Notify>,
    cleanup: CleanupRegistry,
}

impl ShutdownCoordinator {
    /// Create a new coordinator in the `starting` state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LifecycleState::Starting.as_u8())),
            reason: Arc::new(OnceLock::new()),
            notify: Arc::new(Notify::new()),
            cleanup: CleanupRegistry::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn cleanup(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    /// The reason of the first shutdown request, if any.
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// Move `starting → running`. No effect in any other state.
    pub fn mark_running(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                LifecycleState::Starting.as_u8(),
                LifecycleState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if moved {
            info!("Worker running");
        }
        moved
    }

    /// Request shutdown.
    ///
    /// Only the first request counts; returns whether this call moved the
    /// worker into `shutting-down`.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        let previous = self
            .state
            .fetch_max(LifecycleState::ShuttingDown.as_u8(), Ordering::SeqCst);
        if LifecycleState::from_u8(previous) == LifecycleState::ShuttingDown
            || LifecycleState::from_u8(previous) == LifecycleState::Terminated
        {
            debug!("Shutdown already in progress");
            return false;
        }

        match &reason {
            ShutdownReason::Terminate => info!("Shutdown requested"),
            ShutdownReason::Uncaught(message) => {
                warn!("Shutting down after uncaught error: {}", message)
            }
        }
        let _ = self.reason.set(reason);
        self.notify.notify_waiters();
        true
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= LifecycleState::ShuttingDown.as_u8()
    }

    /// Wait for shutdown to be requested.
    ///
    /// Returns immediately if shutdown is already requested.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Run every registered cleanup concurrently and wait for all of them.
    ///
    /// Callbacks run at most once over the coordinator's lifetime. Called
    /// before any shutdown request, this counts as a `terminate` request so
    /// the worker still passes through `shutting-down`. Returns the exit code
    /// for the worker process.
    pub async fn run_cleanups(&self) -> i32 {
        if !self.is_shutdown_requested() {
            debug!("Cleanups run without a shutdown request");
            self.request_shutdown(ShutdownReason::Terminate);
        }

        let callbacks = self.cleanup.drain();
        if !callbacks.is_empty() {
            info!("Running {} cleanup callback(s)", callbacks.len());
            join_all(callbacks.into_iter().map(|callback| callback())).await;
        }

        self.state
            .store(LifecycleState::Terminated.as_u8(), Ordering::SeqCst);
        self.reason().map_or(0, ShutdownReason::exit_code)
    }

    /// Treat interrupt/terminate signals as a `terminate` request.
    ///
    /// On Unix: listens for SIGTERM and SIGINT, repeatedly.
    /// On Windows: listens for Ctrl+C.
    pub fn start_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                {
                    let mut sigterm =
                        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("Failed to create SIGTERM handler: {}", e);
                                if signal::ctrl_c().await.is_err() {
                                    return;
                                }
                                coordinator.request_shutdown(ShutdownReason::Terminate);
                                continue;
                            }
                        };

                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        result = signal::ctrl_c() => {
                            if let Err(e) = result {
                                warn!("Failed to listen for interrupt: {}", e);
                                return;
                            }
                            info!("Received SIGINT");
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    if let Err(e) = signal::ctrl_c().await {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received Ctrl+C");
                }

                coordinator.request_shutdown(ShutdownReason::Terminate);
            }
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_state() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), LifecycleState::Starting);
        assert!(!coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_state_machine_has_no_return_transition() {
        let coordinator = ShutdownCoordinator::new();

        assert!(coordinator.mark_running());
        assert_eq!(coordinator.state(), LifecycleState::Running);

        assert!(coordinator.request_shutdown(ShutdownReason::Terminate));
        assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);

        assert!(!coordinator.mark_running());
        assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);

        assert_eq!(coordinator.run_cleanups().await, 0);
        assert_eq!(coordinator.state(), LifecycleState::Terminated);

        assert!(!coordinator.request_shutdown(ShutdownReason::Terminate));
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_from_starting() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.request_shutdown(ShutdownReason::Uncaught("boom".to_string())));
        assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);
        assert_eq!(coordinator.run_cleanups().await, 1);
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown(ShutdownReason::Terminate);
        coordinator.request_shutdown(ShutdownReason::Uncaught("late".to_string()));

        assert_eq!(coordinator.reason(), Some(&ShutdownReason::Terminate));
        assert_eq!(coordinator.run_cleanups().await, 0);
    }

    #[tokio::test]
    async fn test_cleanups_run_once() {
        let coordinator = ShutdownCoordinator::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            coordinator.cleanup().register(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(coordinator.cleanup().len(), 3);

        coordinator.request_shutdown(ShutdownReason::Terminate);
        coordinator.request_shutdown(ShutdownReason::Terminate);
        coordinator.run_cleanups().await;
        coordinator.run_cleanups().await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(coordinator.cleanup().is_empty());
    }

    #[tokio::test]
    async fn test_cleanups_run_concurrently() {
        let coordinator = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        // The first cleanup only finishes once the second one has run.
        coordinator.cleanup().register(move || async move {
            let _ = rx.await;
        });
        coordinator.cleanup().register(move || async move {
            let _ = tx.send(());
        });

        let result =
            tokio::time::timeout(Duration::from_secs(1), coordinator.run_cleanups()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cleanups_from_running_pass_through_shutting_down() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.mark_running();

        let observed = Arc::new(Mutex::new(None));
        let watcher = coordinator.clone();
        let seen = observed.clone();
        coordinator.cleanup().register(move || async move {
            *seen.lock().unwrap() = Some(watcher.state());
        });

        assert_eq!(coordinator.run_cleanups().await, 0);
        assert_eq!(
            *observed.lock().unwrap(),
            Some(LifecycleState::ShuttingDown)
        );
        assert_eq!(coordinator.reason(), Some(&ShutdownReason::Terminate));
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_register_after_drain_is_ignored() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.run_cleanups().await;
        coordinator.cleanup().register(|| async {});
        assert!(coordinator.cleanup().is_empty());
    }

    #[tokio::test]
    async fn test_wait_already_requested() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown(ShutdownReason::Terminate);

        let result =
            tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_then_request() {
        let coordinator = ShutdownCoordinator::new();
        let coordinator2 = coordinator.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator2.request_shutdown(ShutdownReason::Terminate);
        });

        let result =
            tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_shutdown()).await;
        assert!(result.is_ok());
        assert!(coordinator.is_shutdown_requested());
    }
}
