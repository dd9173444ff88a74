pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod host;
pub mod listener;
pub mod logging;
pub mod status;
pub mod traits;

use tokio::sync::broadcast;

pub use tracing;

/// Lifecycle broadcast shared by every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Resolves once `signal` asks for shutdown or its sender is gone.
pub async fn stopped(signal: &mut broadcast::Receiver<Signal>) {
    loop {
        match signal.recv().await {
            Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::{Signal, stopped};

    #[tokio::test]
    async fn stops_on_shutdown_or_closed_sender() {
        let (sender, mut receiver) = broadcast::channel(4);
        sender.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut receiver))
            .await
            .unwrap();

        let (sender, mut receiver) = broadcast::channel::<Signal>(4);
        drop(sender);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut receiver))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_waiting_without_a_signal() {
        let (_sender, mut receiver) = broadcast::channel::<Signal>(4);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stopped(&mut receiver))
                .await
                .is_err()
        );
    }
}
