//! Process-wide cancellation signal.
//!
//! Set once by [`ShutdownTx::shutdown`] and observed by every stage worker at
//! each suspension point. The signal is never re-armed.

use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Request cancellation. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation was requested.
    ///
    /// If every sender is gone without requesting cancellation, this never
    /// resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

/// Hands `item` to the next stage, racing the send against cancellation.
///
/// Returns `false` when the item could not be delivered, either because
/// cancellation won or because the receiving stage is gone. The item is
/// dropped in that case.
pub async fn forward<T>(tx: &mpsc::Sender<T>, item: T, shutdown: &ShutdownRx) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        assert!(!rx.is_shutdown());

        let waiter = tokio::spawn({
            let rx = rx.clone();
            async move { rx.cancelled().await }
        });

        tx.shutdown();
        tx.shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation observed")
            .unwrap();
        assert!(rx.is_shutdown());
        assert!(tx.subscribe().is_shutdown());
    }

    #[tokio::test]
    async fn test_cancelled_pends_when_sender_dropped() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);

        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.cancelled()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_forward_gives_up_on_cancellation() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (tx, mut rx) = mpsc::channel(1);

        assert!(forward(&tx, 1, &shutdown_rx).await);

        // Channel is full; only cancellation can unblock the second send.
        shutdown_tx.shutdown();
        assert!(!forward(&tx, 2, &shutdown_rx).await);

        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_forward_reports_closed_receiver() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);

        assert!(!forward(&tx, 1, &shutdown_rx).await);
    }
}
