//! Interrupt forwarding.
//!
//! The Ctrl+C listener only flips a flag. Teardown always runs on the
//! control flow that owns the service, never inside the listener.

use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// Spawns the Ctrl+C listener. Must be called inside the runtime.
    pub fn install() -> Self {
        let (tx, interrupt) = Self::channel();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    let _ = tx.send(true);
                    // Keep the sender alive so waiters never see a closed channel.
                    std::future::pending::<()>().await;
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        });
        interrupt
    }

    /// A flag driven by hand. Used by tests.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set. Never resolves if the sender is gone
    /// without having set it.
    pub async fn triggered(&mut self) {
        let closed = self.rx.wait_for(|set| *set).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
