//! Cooperative cancellation for engine operations.
//!
//! Public async operations on the engine take a [`CancelSignal`]; when the
//! paired [`Canceller`] fires, in-flight stream I/O is aborted with
//! H3_REQUEST_CANCELLED and the operation returns a cancellation error
//! instead of a protocol failure.

use tokio::sync::watch;

/// Fires the paired [`CancelSignal`]s. Dropping the canceller without
/// calling [`Canceller::cancel`] leaves the signals permanently unset.
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Create a canceller and its observable signal.
    pub fn new() -> (Canceller, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Canceller { tx }, CancelSignal { rx: Some(rx) })
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observable cancellation state, cheap to clone.
#[derive(Clone)]
pub struct CancelSignal {
    /// `None` means "never cancelled" (no canceller exists).
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires, for callers without a cancellation source.
    pub fn never() -> CancelSignal {
        CancelSignal { rx: None }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow(),
            None => false,
        }
    }

    /// Resolves once cancellation is requested; pends forever on a signal
    /// whose canceller went away without firing.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Canceller dropped; can never fire now.
                return std::future::pending().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_cancelled() {
        let (canceller, signal) = Canceller::new();
        assert!(!signal.is_cancelled());
        canceller.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn never_signal_pends() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            signal.cancelled(),
        )
        .await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn clone_observes_cancel() {
        let (canceller, signal) = Canceller::new();
        let cloned = signal.clone();
        canceller.cancel();
        cloned.cancelled().await;
    }
}
