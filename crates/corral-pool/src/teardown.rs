//! Asynchronous cleanup-and-destroy offload
//!
//! One worker task per connection being torn down asynchronously, tracked in
//! an active set so the pool manager can tell how many teardowns are still
//! outstanding (drain waits on the set going empty). The releasing caller
//! never waits on slow driver teardown.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub(crate) struct TeardownTracker {
    active: Mutex<HashSet<u64>>,
    drained: Notify,
}

impl TeardownTracker {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            drained: Notify::new(),
        }
    }

    /// Number of teardown workers still running.
    pub(crate) fn pending(&self) -> usize {
        self.active.lock().len()
    }

    /// Track a connection entering asynchronous teardown.
    pub(crate) fn begin(&self, connection_id: u64) {
        self.active.lock().insert(connection_id);
    }

    /// Finish a worker and wake anyone waiting for the set to empty.
    pub(crate) fn finish(&self, connection_id: u64) {
        let mut active = self.active.lock();
        active.remove(&connection_id);
        if active.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no teardown workers remain.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}
