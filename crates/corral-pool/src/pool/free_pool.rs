//! Idle-connection bookkeeping and the destroy path

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use corral_core::{ConnectionFactory, SharingScope};

use crate::wrapper::ManagedConnection;

struct Buckets {
    /// Idle connections, most recently used at the back
    free: Vec<Arc<ManagedConnection>>,
    /// Checked-out connections, keyed by connection id
    in_use: HashMap<u64, Arc<ManagedConnection>>,
}

/// Free-list and in-use bookkeeping for one pool.
///
/// Bucket membership is guarded by a single lock held only across the
/// membership mutation itself, never across a driver call. Capacity
/// admission is a semaphore with `max_size` permits: a checked-out
/// connection carries its permit, and dropping the permit wakes exactly one
/// waiting acquirer.
pub(crate) struct FreePool {
    buckets: Mutex<Buckets>,
    semaphore: Arc<Semaphore>,
    /// Connections owned by the pool anywhere: free, in use, or pending
    /// an asynchronous destroy
    total: AtomicUsize,
    /// Callers currently waiting in acquire
    waiting: AtomicUsize,
}

impl FreePool {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                free: Vec::with_capacity(max_size),
                in_use: HashMap::with_capacity(max_size),
            }),
            semaphore: Arc::new(Semaphore::new(max_size)),
            total: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    pub(crate) fn total_size(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn free_list_size(&self) -> usize {
        self.buckets.lock().free.len()
    }

    pub(crate) fn in_use_size(&self) -> usize {
        self.buckets.lock().in_use.len()
    }

    pub(crate) fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn add_waiter(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_waiter(&self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Count a newly created connection into the pool.
    pub(crate) fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Claim an idle connection for the given request signature.
    ///
    /// Prefers the most recently used connection with a matching cached
    /// signature (avoids driver re-authentication); falls back to the most
    /// recently used connection with the same sharing scope. The pop happens
    /// under the bucket lock, so no two callers can claim one connection.
    pub(crate) fn pop_idle(
        &self,
        signature: u64,
        sharing: SharingScope,
    ) -> Option<Arc<ManagedConnection>> {
        let mut b = self.buckets.lock();
        if let Some(pos) = b.free.iter().rposition(|w| w.signature() == signature) {
            return Some(b.free.remove(pos));
        }
        if let Some(pos) = b.free.iter().rposition(|w| w.sharing() == sharing) {
            return Some(b.free.remove(pos));
        }
        None
    }

    /// Track a connection as checked out.
    pub(crate) fn insert_in_use(&self, wrapper: Arc<ManagedConnection>) {
        self.buckets.lock().in_use.insert(wrapper.id(), wrapper);
    }

    /// Move a connection from the in-use bucket back to the free list,
    /// handing the caller the capacity permit to drop once done.
    ///
    /// Returns `None` (and leaves the buckets alone) when a forced teardown
    /// claimed the connection concurrently; the claiming path owns removal.
    pub(crate) fn return_to_free(
        &self,
        wrapper: &Arc<ManagedConnection>,
    ) -> Option<OwnedSemaphorePermit> {
        let permit = wrapper.try_mark_free()?;
        let mut b = self.buckets.lock();
        b.in_use.remove(&wrapper.id());
        b.free.push(wrapper.clone());
        Some(permit)
    }

    /// Snapshot of every checked-out connection.
    pub(crate) fn in_use_snapshot(&self) -> Vec<Arc<ManagedConnection>> {
        self.buckets.lock().in_use.values().cloned().collect()
    }

    /// Claim up to `limit` idle connections matching the predicate,
    /// scanning least recently used first.
    pub(crate) fn claim_idle_where<F>(&self, limit: usize, pred: F) -> Vec<Arc<ManagedConnection>>
    where
        F: Fn(&ManagedConnection) -> bool,
    {
        let mut b = self.buckets.lock();
        let mut claimed = Vec::new();
        let mut i = 0;
        while i < b.free.len() && claimed.len() < limit {
            if pred(&b.free[i]) {
                claimed.push(b.free.remove(i));
            } else {
                i += 1;
            }
        }
        claimed
    }

    /// Claim the entire free list.
    pub(crate) fn drain_free(&self) -> Vec<Arc<ManagedConnection>> {
        std::mem::take(&mut self.buckets.lock().free)
    }

    /// Remove a connection from whichever bucket currently tracks it.
    ///
    /// `existed_in_free_pool` selects the bucket to look in; a connection
    /// already claimed out of its bucket simply is not found, which is fine.
    /// `decrement_total` is false when the caller never entered the
    /// connection into `total` bookkeeping (a brand-new connection discarded
    /// mid-acquire). Waiter notification is carried by the capacity permit,
    /// which the claiming path has already released.
    pub(crate) fn remove(
        &self,
        wrapper: &ManagedConnection,
        existed_in_free_pool: bool,
        decrement_total: bool,
    ) -> bool {
        let removed = {
            let mut b = self.buckets.lock();
            if existed_in_free_pool {
                match b.free.iter().position(|w| w.id() == wrapper.id()) {
                    Some(pos) => {
                        b.free.remove(pos);
                        true
                    }
                    None => false,
                }
            } else {
                b.in_use.remove(&wrapper.id()).is_some()
            }
        };
        if decrement_total {
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Run transaction-side resource release and the factory destroy.
    ///
    /// Destroy-time errors from the external driver are recorded, never
    /// propagated: a connection that fails to close cleanly must still leave
    /// the pool's accounting or capacity leaks.
    pub(crate) async fn cleanup_and_destroy(
        &self,
        factory: &Arc<dyn ConnectionFactory>,
        wrapper: &Arc<ManagedConnection>,
    ) {
        {
            let mut txn = wrapper.txn().lock().await;
            if let Err(e) = txn.release_resources().await {
                tracing::warn!(
                    connection = wrapper.id(),
                    error = %e,
                    "transaction resource release failed during destroy"
                );
            }
        }
        if let Err(e) = factory.destroy(wrapper.physical()).await {
            tracing::warn!(
                connection = wrapper.id(),
                error = %e,
                "connection destroy failed; removing it from the pool anyway"
            );
        }
    }
}
