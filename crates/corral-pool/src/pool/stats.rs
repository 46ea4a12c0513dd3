//! Pool statistics types

use serde::{Deserialize, Serialize};

/// Statistics about a pool's current state
///
/// Snapshot for the operations/administration layer. `free <= total` holds
/// for every snapshot; a connection counted in `total` but not free is
/// either in use or being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections owned by the pool anywhere (free, in use, tearing down)
    total: usize,
    /// Connections sitting idle in the free list
    free: usize,
    /// Connections currently checked out
    in_use: usize,
    /// Callers waiting for a connection
    waiting: usize,
    /// Asynchronous teardown workers still running
    pending_teardown: usize,
}

impl PoolStats {
    /// Create new pool statistics
    pub fn new(
        total: usize,
        free: usize,
        in_use: usize,
        waiting: usize,
        pending_teardown: usize,
    ) -> Self {
        Self {
            total,
            free,
            in_use,
            waiting,
            pending_teardown,
        }
    }

    /// Get the total number of connections
    pub fn total(&self) -> usize {
        self.total
    }

    /// Get the number of idle connections
    pub fn free(&self) -> usize {
        self.free
    }

    /// Get the number of checked-out connections
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Get the number of waiting callers
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Get the number of teardown workers still running
    pub fn pending_teardown(&self) -> usize {
        self.pending_teardown
    }

    /// Calculate pool utilization as a fraction (0.0 to 1.0)
    ///
    /// Returns 0.0 if total is 0 to avoid division by zero.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.in_use as f64 / self.total as f64
        }
    }

    /// Check if every owned connection is currently checked out
    pub fn is_full(&self) -> bool {
        self.free == 0 && self.total > 0
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new(0, 0, 0, 0, 0)
    }
}
