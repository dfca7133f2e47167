//! Epoch-based cancellation.
//!
//! Every utterance captures the epoch at start. Bumping the epoch cancels
//! every token taken before the bump; stale work notices on its next check
//! or wakes from [`CancelToken::cancelled`].

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Cancellation source owned by the orchestrator.
#[derive(Clone)]
pub struct Epoch {
    tx: Arc<watch::Sender<u64>>,
}

impl Epoch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Token bound to the current epoch.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            epoch: self.current(),
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel all outstanding tokens. Returns the new epoch.
    pub fn bump(&self) -> u64 {
        self.tx.send_modify(|e| *e += 1);
        self.current()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle checked by long-running work.
#[derive(Clone)]
pub struct CancelToken {
    epoch: u64,
    rx: watch::Receiver<u64>,
}

impl CancelToken {
    /// A token nothing can cancel.
    pub fn never() -> Self {
        Epoch::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.epoch
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled. Pends forever if its epoch
    /// source is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() != self.epoch {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
