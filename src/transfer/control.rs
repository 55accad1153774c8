//! Cancellation and pause signals for a running batch

use tokio::sync::watch;

/// Control handle shared between the worker and whoever started the batch.
///
/// Cancellation is one-way: once set it is never cleared.
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            pause_tx,
            pause_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Resolve once the batch is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // Sender lives in self, so wait_for only fails if we are dropped mid-await
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Block while paused. Returns `false` if cancelled in the meantime.
    pub async fn wait_while_paused(&self) -> bool {
        if !self.is_paused() {
            return !self.is_cancelled();
        }
        let mut pause_rx = self.pause_rx.clone();
        tokio::select! {
            _ = pause_rx.wait_for(|paused| !*paused) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}
