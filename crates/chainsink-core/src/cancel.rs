//! Cooperative cancellation for flush and revert.
//!
//! The signal is checked between statements; a cancelled transaction is
//! rolled back by the caller and the staging area stays as it was.

use tokio::sync::watch;

use crate::error::SinkError;

/// Sending half, held by whoever decides to stop (e.g. a Ctrl-C handler).
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A linked handle / signal pair.
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// `Err(SinkError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), SinkError> {
        if self.is_cancelled() {
            Err(SinkError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested. Never resolves for
    /// [`CancelSignal::never`] or when the handle was dropped unfired.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}
