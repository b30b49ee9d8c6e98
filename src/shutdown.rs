//! Graceful shutdown coordination for logflow.
//!
//! This module provides a [`ShutdownSignal`] shared by the signal handler and
//! the worker loop. The worker checks [`ShutdownSignal::is_triggered`] between
//! cycles, so a batch that is already being written always runs to completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use logflow::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     // Listen for SIGINT/SIGTERM in the background
//!     let listener = shutdown.clone();
//!     tokio::spawn(async move { listener.wait().await });
//!
//!     while !shutdown.is_triggered() {
//!         // ... process one batch
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default time allowed for draining, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
///
/// Clones share state: triggering one triggers all of them.
#[derive(Clone)]
pub struct ShutdownSignal {
    /// Broadcast sender for shutdown notification
    sender: broadcast::Sender<()>,
    /// Set once shutdown has been requested
    triggered: Arc<AtomicBool>,
    /// How long draining may take before the process gives up
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    /// Non-blocking check used between worker cycles.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.notify();
    }

    /// Resolve once shutdown has been triggered, immediately if it already was.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Drive `work` to completion, but give up once shutdown has been
    /// triggered and `timeout` has passed since.
    ///
    /// Returns `None` when the work was abandoned.
    pub async fn bounded<F: Future>(&self, work: F) -> Option<F::Output> {
        tokio::pin!(work);

        let deadline = async {
            self.triggered().await;
            tokio::time::sleep(self.timeout).await;
        };

        tokio::select! {
            output = &mut work => Some(output),
            _ = deadline => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Shutdown timeout reached, abandoning drain"
                );
                None
            }
        }
    }

    fn notify(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_triggered());
    }

    #[tokio::test]
    async fn test_custom_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.triggered()).await;
        assert!(result.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_share_flag() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        clone.trigger();

        assert!(signal.is_triggered());
        // Already triggered: resolves without a new notification
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bounded_returns_finished_work() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(20));
        signal.trigger();

        let output = signal.bounded(async { 7 }).await;
        assert_eq!(output, Some(7));
    }

    #[tokio::test]
    async fn test_bounded_runs_freely_until_triggered() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(10));

        let output = signal
            .bounded(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "done"
            })
            .await;
        assert_eq!(output, Some("done"));
    }

    #[tokio::test]
    async fn test_bounded_abandons_stuck_drain() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(20));

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let output = tokio::time::timeout(
            Duration::from_secs(2),
            signal.bounded(std::future::pending::<()>()),
        )
        .await
        .unwrap();
        assert_eq!(output, None);
    }
}
