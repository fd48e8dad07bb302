//! Shutdown coordination
//!
//! A single `watch` flag shared by the scheduler and the service loop, set
//! either programmatically or by an OS signal (Ctrl+C, SIGTERM).

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn request(&self, reason: &str) {
        if self.is_requested() {
            warn!("Shutdown already requested, ignoring: {}", reason);
            return;
        }
        info!("Shutdown requested: {}", reason);
        self.tx.send_replace(true);
    }

    /// Wait for Ctrl+C or SIGTERM, then flip the flag
    pub async fn listen_for_signals(&self) {
        wait_for_signal().await;
        self.request("signal received");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
