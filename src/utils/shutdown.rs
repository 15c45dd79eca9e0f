//! Explicit shutdown signalling.
//!
//! Instead of raw OS-signal handling scattered through the engine, a single
//! [`Shutdown`] controller owns the decision and hands out [`ShutdownToken`]s
//! that long-running loops observe at their natural suspension points (event
//! recv, timer tick, queue pop).
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Owns the shutdown decision. Cheap to share behind an `Arc`.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand out a token for a loop to observe.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Trigger shutdown once; later calls are ignored.
    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("shutdown triggered");
            let _ = self.tx.send(());
        } else {
            tracing::warn!("shutdown already in progress, ignoring trigger");
        }
    }

    /// Listen for SIGINT/SIGTERM and trigger shutdown on the first one.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        self.trigger();
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// Observer side of [`Shutdown`].
pub struct ShutdownToken {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }
}

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Resolve when shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn wait(&mut self) {
        if self.is_triggered() {
            return;
        }
        // A closed or lagged channel also means the controller is gone.
        let _ = self.rx.recv().await;
    }
}
