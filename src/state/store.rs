use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::snapshot::Snapshot;

/// Holder of the current [`Snapshot`].
///
/// Backed by a `watch` channel of `Arc<Snapshot>`: every mutation swaps in a freshly
/// built snapshot, so `current()` hands out a reference to a complete value and
/// readers never lock.
///
/// Only the inbound pipeline (merge results and transport connectivity) mutates the
/// store, hence the crate-private mutators.
#[derive(Debug)]
pub struct StateStore {
    current: watch::Sender<Arc<Snapshot>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Snapshot::initial())
    }
}

impl StateStore {
    pub fn new(initial: Snapshot) -> Self {
        let (current, _) = watch::channel(Arc::new(initial));
        Self { current }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.borrow().clone()
    }

    pub(crate) fn replace(&self, snapshot: Arc<Snapshot>) {
        debug!(revision = snapshot.revision, "Replacing snapshot");
        self.current.send_replace(snapshot);
    }

    /// Flips the online flag without touching revision or timestamp.
    pub(crate) fn set_online(&self, online: bool) {
        self.current.send_if_modified(|current| {
            if current.online == online {
                return false;
            }
            info!(online, "Bridge online state changed");
            let mut next = Snapshot::clone(current);
            next.online = online;
            *current = Arc::new(next);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_whole_snapshot() {
        let store = StateStore::default();
        let before = store.current();

        let mut next = Snapshot::clone(&before);
        next.revision = 7;
        store.replace(Arc::new(next));

        assert_eq!(before.revision, 0);
        assert_eq!(store.current().revision, 7);
    }

    #[test]
    fn set_online_keeps_revision() {
        let store = StateStore::default();
        store.set_online(true);
        let online = store.current();
        assert!(online.online);
        assert_eq!(online.revision, 0);

        store.set_online(false);
        assert!(!store.current().online);
        assert!(online.online, "earlier readers keep their value");
    }
}
