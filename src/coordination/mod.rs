//! Shutdown coordination.
//!
//! A single watch channel carries the shutdown signal to every supervisor,
//! dispatcher, and cache. Components either poll `is_shutdown` before a
//! write or select on `wait` inside their loops; no partial cache writes
//! happen once the signal is raised.

use tokio::sync::watch;
use tracing::info;

/// Owner side of the shutdown signal.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownToken { rx })
    }

    /// Raise the shutdown signal. Idempotent.
    pub fn trigger(&self) {
        if !*self.tx.borrow() {
            info!("shutdown requested");
            let _ = self.tx.send(true);
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cloneable token for checking or awaiting shutdown in async tasks.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until shutdown is requested. Returns immediately if it
    /// already was, or if the controller was dropped.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}
