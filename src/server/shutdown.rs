//! Graceful shutdown coordinator for Floodgate
//!
//! Central point for signal handling and background task shutdown. Background
//! tasks (the deduplication sweeper) subscribe through `ShutdownAwareTask` and
//! are registered so `wait_for_tasks_completion` can join them with a bound.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Shutdown coordinator that manages graceful shutdown of all services
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    /// Atomic flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Create a shutdown receiver for background tasks
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Track a background task so shutdown can wait for it
    pub fn register(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Initiate graceful shutdown. Idempotent.
    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            info!("Initiating graceful shutdown...");
            if let Err(e) = self.shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }
    }

    /// Wait for SIGTERM, SIGINT or a manual trigger, then initiate shutdown
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut manual = self.subscribe();
        if self.is_shutdown_initiated() {
            return;
        }

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
            _ = manual.recv() => {
                info!("Shutdown requested");
            }
        }

        self.initiate_shutdown();
    }

    /// Join registered background tasks, giving up after `timeout`
    pub async fn wait_for_tasks_completion(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return;
        }

        info!(
            "Waiting up to {}ms for {} background task(s) to complete...",
            timeout.as_millis(),
            handles.len()
        );

        let join_all = futures::future::join_all(handles);
        match tokio::time::timeout(timeout, join_all).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Background task ended abnormally: {}", e);
                    }
                }
                info!("Background tasks completed shutdown");
            }
            Err(_) => {
                warn!("Shutdown timeout reached, some tasks may not have completed gracefully");
            }
        }
    }
}

/// Background task wrapper that handles shutdown signals
pub struct ShutdownAwareTask {
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ShutdownAwareTask {
    pub fn new(coordinator: &ShutdownCoordinator) -> Self {
        Self {
            shutdown_rx: coordinator.subscribe(),
            shutdown_initiated: coordinator.shutdown_initiated.clone(),
        }
    }

    /// Check if shutdown has been requested
    pub fn should_shutdown(&mut self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst) || self.shutdown_rx.try_recv().is_ok()
    }

    /// Wait for either a shutdown signal or the specified duration; true means shut down
    pub async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        if self.shutdown_initiated.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
