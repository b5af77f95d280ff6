//! Live RolloutState published to readers as immutable snapshots.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use stagehand_core::RolloutState;
use tokio::sync::watch;

/// Writers serialize on an inner mutex; every update swaps in a fresh snapshot
/// and bumps the epoch so subscribers can react.
pub struct StateBoard {
    inner: Mutex<RolloutState>,
    snap: ArcSwap<RolloutState>,
    epoch_tx: watch::Sender<u64>,
}

impl StateBoard {
    pub fn new(initial: RolloutState) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(initial.clone()), inner: Mutex::new(initial), epoch_tx }
    }

    /// Mutate the state and publish the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut RolloutState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        self.snap.store(Arc::new(guard.clone()));
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        out
    }

    pub fn current(&self) -> Arc<RolloutState> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{ResourceSpec, RolloutStatus};

    #[tokio::test]
    async fn updates_publish_snapshot_and_epoch() {
        let spec = ResourceSpec::new("ConfigMap", "cfg", 0);
        let board = StateBoard::new(RolloutState::new([&spec]));
        let mut rx = board.subscribe_epoch();
        let before = board.current();

        let moved = board.update(|s| s.advance(&spec.id, RolloutStatus::Applying));
        assert!(moved);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(board.epoch(), 1);
        assert_eq!(before.status(&spec.id), Some(RolloutStatus::Pending));
        assert_eq!(board.current().status(&spec.id), Some(RolloutStatus::Applying));
    }
}
