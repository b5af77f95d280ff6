//! Cancellation shared by every in-flight wait of a rollout.

use std::sync::Arc;

use tokio::sync::watch;

/// Fires the paired [`CancelSignal`]s. Cloneable; any clone may cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed side of a cancellation. Clone one per concurrent waiter.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pends forever when the handle is gone without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                if *self.rx.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_every_clone() {
        let (handle, signal) = cancel_pair();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let mut s = signal.clone();
                tokio::spawn(async move { s.cancelled().await })
            })
            .collect();
        handle.cancel();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w).await.expect("waiter woke").unwrap();
        }
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let mut s = CancelSignal::never();
        assert!(!s.is_cancelled());
        let r = tokio::time::timeout(Duration::from_secs(5), s.cancelled()).await;
        assert!(r.is_err());
    }
}
