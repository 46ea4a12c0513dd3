//! Pool orchestration: acquire/release, handle park/reassociate, reaping
//! callbacks, and drain

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use corral_core::{
    BranchId, ConnectionFactory, ConnectionRequest, CorralError, Identity, Result,
    TransactionCoordinator, TxId,
};

use crate::config::PoolConfig;
use crate::handle::ConnectionHandle;
use crate::pool::free_pool::FreePool;
use crate::pool::stats::PoolStats;
use crate::reaper::ReapScheduler;
use crate::teardown::TeardownTracker;
use crate::txn::TransactionWrapper;
use crate::wrapper::{ConnectionState, DestroyCause, ManagedConnection};

/// Orchestrator for one logical pool of managed connections.
///
/// Callers acquire and release connection handles; background tasks enforce
/// idle, aged, and in-use time limits by calling back into the manager. All
/// bucket mutation happens under the free pool's lock, held only across the
/// membership change itself; driver calls always run outside it.
pub struct PoolManager {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    coordinator: Arc<dyn TransactionCoordinator>,
    free_pool: FreePool,
    teardown: TeardownTracker,
    reaper: Mutex<Option<ReapScheduler>>,
    draining: AtomicBool,
    next_id: AtomicU64,
    next_branch: AtomicU64,
    idle_reap_active: AtomicBool,
    aged_timeout_active: AtomicBool,
    max_in_use_active: AtomicBool,
}

impl PoolManager {
    /// Create a pool manager and start its background reap tasks.
    ///
    /// Must be called within a tokio runtime. Use [`PoolManager::new_unscheduled`]
    /// to drive the reap tasks manually instead.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) -> Arc<Self> {
        let pool = Self::new_unscheduled(config, factory, coordinator);
        let scheduler = ReapScheduler::start(&pool);
        *pool.reaper.lock() = Some(scheduler);
        pool
    }

    /// Create a pool manager without background tasks; the reap entry points
    /// can be invoked directly.
    pub fn new_unscheduled(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) -> Arc<Self> {
        let max_size = config.max_size();
        Arc::new(Self {
            config,
            factory,
            coordinator,
            free_pool: FreePool::new(max_size),
            teardown: TeardownTracker::new(),
            reaper: Mutex::new(None),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            next_branch: AtomicU64::new(0),
            idle_reap_active: AtomicBool::new(false),
            aged_timeout_active: AtomicBool::new(false),
            max_in_use_active: AtomicBool::new(false),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connection handle for the given request and identity.
    ///
    /// Reuses an idle connection whose cached signature or sharing scope is
    /// compatible, or creates a new one when capacity allows. Waits up to
    /// the configured acquire timeout when the pool is at capacity.
    #[tracing::instrument(skip(self, request, identity), fields(principal = identity.principal(), sharing = ?request.sharing()))]
    pub async fn acquire(
        self: &Arc<Self>,
        request: ConnectionRequest,
        identity: Identity,
    ) -> Result<ConnectionHandle> {
        let wrapper = self.acquire_wrapper(&request, &identity).await?;
        Ok(ConnectionHandle::new(
            self.clone(),
            request,
            identity,
            wrapper,
        ))
    }

    pub(crate) async fn acquire_wrapper(
        self: &Arc<Self>,
        request: &ConnectionRequest,
        identity: &Identity,
    ) -> Result<Arc<ManagedConnection>> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(CorralError::PoolExhausted(
                "pool is draining, new requests are rejected".into(),
            ));
        }

        self.free_pool.add_waiter();
        let permit = tokio::time::timeout(
            self.config.acquire_timeout(),
            self.free_pool.semaphore().acquire_owned(),
        )
        .await;
        self.free_pool.remove_waiter();
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CorralError::PoolExhausted("pool semaphore closed".into()));
            }
            Err(_) => {
                return Err(CorralError::PoolExhausted(format!(
                    "no connection became available within {:?}",
                    self.config.acquire_timeout()
                )));
            }
        };

        let signature = request.signature(identity);
        let (wrapper, reused) = loop {
            match self.free_pool.pop_idle(signature, request.sharing()) {
                Some(candidate) => {
                    if candidate.is_stale()
                        || candidate.has_aged_out(self.config.aged_timeout())
                        || !candidate.physical().is_valid()
                    {
                        let cause = if candidate.has_aged_out(self.config.aged_timeout()) {
                            DestroyCause::AgedTimeout
                        } else {
                            DestroyCause::Stale
                        };
                        if candidate.claim_for_destroy(cause).is_some() {
                            self.retire(candidate, true, true).await;
                        }
                        continue;
                    }
                    // reset the strategy to this request's enlistment policy
                    {
                        let mut txn = candidate.txn().lock().await;
                        *txn = TransactionWrapper::for_policy(
                            request.enlistment(),
                            self.coordinator.clone(),
                        );
                    }
                    break (candidate, true);
                }
                None => {
                    let physical = match self.factory.create(request, identity).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            // permit drops here, waking one waiter
                            return Err(CorralError::ConnectionCreateFailed(e.to_string()));
                        }
                    };
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let txn = TransactionWrapper::for_policy(
                        request.enlistment(),
                        self.coordinator.clone(),
                    );
                    let wrapper = Arc::new(ManagedConnection::new(
                        id,
                        physical,
                        signature,
                        request.sharing(),
                        txn,
                    ));
                    tracing::debug!(connection = id, "created new physical connection");
                    break (wrapper, false);
                }
            }
        };

        // enlist in the caller's transaction before handing the connection out
        if let Some(ctx) = self.coordinator.current_context() {
            let branch = BranchId::new(ctx.id(), self.next_branch.fetch_add(1, Ordering::SeqCst));
            let enlisted = {
                let mut txn = wrapper.txn().lock().await;
                txn.enlist(branch, ctx).await
            };
            if let Err(e) = enlisted {
                tracing::warn!(connection = wrapper.id(), error = %e, "enlistment failed; destroying connection");
                drop(permit);
                if wrapper.claim_for_destroy(DestroyCause::EnlistmentFailed).is_some() {
                    // a reused connection was counted; a brand-new one never
                    // entered the total bookkeeping
                    self.retire(wrapper, false, reused).await;
                }
                return Err(CorralError::EnlistmentFailed(e.to_string()));
            }
        }

        wrapper.mark_checked_out(permit);
        if !reused {
            self.free_pool.increment_total();
        }
        self.free_pool.insert_in_use(wrapper.clone());
        tracing::debug!(connection = wrapper.id(), reused, "connection checked out");
        Ok(wrapper)
    }

    /// Close a handle, returning its connection to the free list or
    /// destroying it per the retention policy.
    #[tracing::instrument(skip(self, handle), fields(connection = ?handle.connection_id()))]
    pub async fn release(self: &Arc<Self>, handle: ConnectionHandle) -> Result<()> {
        let wrapper = handle.take_for_close()?;
        self.release_wrapper(wrapper).await;
        Ok(())
    }

    /// Release path shared by explicit close and handle drop.
    ///
    /// Never surfaces an error: cleanup failures turn into a destroy, and a
    /// connection torn down concurrently by a forced abort is absorbed.
    pub(crate) async fn release_wrapper(self: &Arc<Self>, wrapper: Arc<ManagedConnection>) {
        match wrapper.state() {
            ConnectionState::AbortPending | ConnectionState::Destroyed => {
                // the forcing path owns the teardown; nothing left to do here
                if wrapper.destroy_cause().is_some_and(|c| c.is_forced_cleanup()) {
                    tracing::debug!(
                        connection = wrapper.id(),
                        "released a handle whose connection was torn down by a forced cleanup"
                    );
                } else {
                    tracing::warn!(
                        connection = wrapper.id(),
                        cause = ?wrapper.destroy_cause(),
                        "released a handle bound to a destroyed connection"
                    );
                }
                return;
            }
            _ => {}
        }

        let mut failed = false;
        {
            let mut txn = wrapper.txn().lock().await;
            if let Err(e) = txn.cleanup().await {
                tracing::warn!(connection = wrapper.id(), error = %e, "transaction cleanup failed; destroying connection");
                failed = true;
            }
        }
        if !failed && let Err(e) = wrapper.physical().cleanup().await {
            tracing::warn!(connection = wrapper.id(), error = %e, "connection cleanup failed; destroying connection");
            failed = true;
        }

        let cause = if failed {
            Some(DestroyCause::CleanupFailed)
        } else if wrapper.is_stale() {
            Some(DestroyCause::Stale)
        } else if wrapper.has_aged_out(self.config.aged_timeout()) {
            Some(DestroyCause::AgedTimeout)
        } else if self.draining.load(Ordering::SeqCst) {
            Some(DestroyCause::Drained)
        } else {
            None
        };

        match cause {
            None => match self.free_pool.return_to_free(&wrapper) {
                // dropping the permit wakes exactly one waiting acquirer
                Some(permit) => drop(permit),
                None => tracing::debug!(
                    connection = wrapper.id(),
                    "connection was claimed for teardown during release"
                ),
            },
            Some(cause) => {
                if let Some(permit) = wrapper.claim_for_destroy(cause) {
                    drop(permit);
                    self.retire(wrapper, false, true).await;
                }
            }
        }
    }

    /// Detach a handle from its connection so it can survive a transaction
    /// boundary. The connection stays checked out.
    pub fn park_handle(&self, handle: &ConnectionHandle) -> Result<()> {
        let wrapper = handle
            .wrapper()
            .ok_or_else(|| CorralError::IllegalHandleState("cannot park a closed handle".into()))?;
        if wrapper.is_destroyed() {
            if wrapper.destroy_cause().is_some_and(|c| c.is_forced_cleanup()) {
                // absorbed: attributable to a concurrent forced cleanup
                tracing::warn!(
                    connection = wrapper.id(),
                    "parking a handle whose connection was torn down by a forced cleanup"
                );
            } else {
                return Err(CorralError::IllegalHandleState(format!(
                    "connection {} was destroyed ({:?})",
                    wrapper.id(),
                    wrapper.destroy_cause()
                )));
            }
        }
        handle.set_parked()
    }

    /// Re-bind a parked handle: to its original connection when that is
    /// still alive, or to a freshly acquired one when the original was torn
    /// down by the in-use time limit.
    pub async fn reassociate(self: &Arc<Self>, handle: &ConnectionHandle) -> Result<()> {
        let wrapper = handle.wrapper().ok_or_else(|| {
            CorralError::IllegalHandleState("cannot reassociate a closed handle".into())
        })?;
        if !wrapper.is_destroyed() {
            handle.set_bound(wrapper);
            return Ok(());
        }
        if !wrapper.destroy_cause().is_some_and(|c| c.is_forced_cleanup()) {
            return Err(CorralError::IllegalHandleState(format!(
                "connection {} was destroyed ({:?})",
                wrapper.id(),
                wrapper.destroy_cause()
            )));
        }
        // absorbed: replace the force-cleaned connection with a fresh one
        tracing::warn!(
            connection = wrapper.id(),
            "reassociating past a connection torn down by a forced cleanup"
        );
        let fresh = self
            .acquire_wrapper(handle.request(), handle.identity())
            .await?;
        handle.set_bound(fresh);
        Ok(())
    }

    /// Destroy idle connections beyond the minimum pool size that exceeded
    /// the idle timeout. Invoked by the background scheduler.
    pub async fn execute_idle_reap_task(self: &Arc<Self>) {
        if self.idle_reap_active.swap(true, Ordering::SeqCst) {
            return; // previous run still in progress
        }
        let unused = self.config.unused_timeout();
        let reapable = self
            .free_pool
            .total_size()
            .saturating_sub(self.config.min_size());
        let victims = self
            .free_pool
            .claim_idle_where(reapable, |w| w.idle_elapsed() > unused);
        for wrapper in victims {
            tracing::debug!(connection = wrapper.id(), "reaping idle connection");
            if let Some(permit) = wrapper.claim_for_destroy(DestroyCause::IdleTimeout) {
                drop(permit);
                self.retire(wrapper, true, true).await;
            }
        }
        self.idle_reap_active.store(false, Ordering::SeqCst);
    }

    /// Destroy idle connections that exceeded the maximum lifetime. In-use
    /// aged connections are caught when they are released.
    pub async fn execute_aged_timeout_task(self: &Arc<Self>) {
        let Some(aged) = self.config.aged_timeout() else {
            return;
        };
        if self.aged_timeout_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let victims = self
            .free_pool
            .claim_idle_where(usize::MAX, |w| w.age() > aged);
        for wrapper in victims {
            tracing::debug!(connection = wrapper.id(), age = ?wrapper.age(), "retiring aged connection");
            if let Some(permit) = wrapper.claim_for_destroy(DestroyCause::AgedTimeout) {
                drop(permit);
                self.retire(wrapper, true, true).await;
            }
        }
        self.aged_timeout_active.store(false, Ordering::SeqCst);
    }

    /// Force-abort every in-use connection whose checkout exceeded the
    /// configured in-use time limit, and no others.
    ///
    /// Abortable wrappers go through their out-of-band abort; everything
    /// else gets a forced transaction cleanup. Capacity returns to the pool
    /// immediately; the driver-side destroy runs on the teardown path.
    pub async fn execute_max_in_use_task(self: &Arc<Self>) {
        let Some(limit) = self.config.max_in_use_time() else {
            return;
        };
        if self.max_in_use_active.swap(true, Ordering::SeqCst) {
            return;
        }
        for wrapper in self.free_pool.in_use_snapshot() {
            if !wrapper.in_use_elapsed().is_some_and(|d| d > limit) {
                continue;
            }
            let Some(permit) = wrapper.begin_force_abort(DestroyCause::MaxInUseTimeout) else {
                continue;
            };
            tracing::warn!(
                connection = wrapper.id(),
                limit = ?limit,
                "connection exceeded the in-use time limit; forcing teardown"
            );
            {
                let mut txn = wrapper.txn().lock().await;
                let aborted = match txn.context() {
                    Some(ctx) if txn.is_abortable() => txn.abort(ctx.id()).await.is_ok(),
                    _ => false,
                };
                if !aborted && let Err(e) = txn.cleanup().await {
                    tracing::debug!(connection = wrapper.id(), error = %e, "forced transaction cleanup failed");
                }
            }
            drop(permit);
            self.retire(wrapper, false, true).await;
        }
        self.max_in_use_active.store(false, Ordering::SeqCst);
    }

    /// Out-of-band branch abort for a recovery/supervisor component.
    ///
    /// Force-fails every abortable in-use connection enlisted under `tx`,
    /// without going through normal delist or rollback. The coordinator is
    /// assumed to have already terminated the transaction on its side.
    #[tracing::instrument(skip(self), fields(tx = %tx))]
    pub async fn abort_branches(self: &Arc<Self>, tx: TxId) {
        for wrapper in self.free_pool.in_use_snapshot() {
            let enlisted_here = {
                let txn = wrapper.txn().lock().await;
                txn.is_abortable() && txn.context().map(|c| c.id()) == Some(tx)
            };
            if !enlisted_here {
                continue;
            }
            let Some(permit) = wrapper.begin_force_abort(DestroyCause::BranchAborted) else {
                continue;
            };
            tracing::warn!(connection = wrapper.id(), "force-failing transaction branch");
            {
                let mut txn = wrapper.txn().lock().await;
                if let Err(e) = txn.abort(tx).await {
                    tracing::debug!(connection = wrapper.id(), error = %e, "branch abort failed");
                }
            }
            drop(permit);
            self.retire(wrapper, false, true).await;
        }
    }

    /// Driver-reported fatal error: mark the connection stale so it is
    /// destroyed on release, and purge every idle connection.
    #[tracing::instrument(skip(self))]
    pub async fn fatal_error_notification(self: &Arc<Self>, connection_id: u64) {
        for wrapper in self.free_pool.in_use_snapshot() {
            if wrapper.id() == connection_id {
                wrapper.mark_stale();
            }
        }
        for wrapper in self.free_pool.drain_free() {
            if let Some(permit) = wrapper.claim_for_destroy(DestroyCause::Stale) {
                drop(permit);
                self.retire(wrapper, true, true).await;
            }
        }
    }

    /// Block new acquires and destroy every idle connection. In-use
    /// connections are destroyed as they are released. Waits for the
    /// asynchronous teardown workers currently outstanding.
    #[tracing::instrument(skip(self))]
    pub async fn drain(self: &Arc<Self>) {
        self.draining.store(true, Ordering::SeqCst);
        for wrapper in self.free_pool.drain_free() {
            if let Some(permit) = wrapper.claim_for_destroy(DestroyCause::Drained) {
                drop(permit);
                self.retire(wrapper, true, true).await;
            }
        }
        for wrapper in self.free_pool.in_use_snapshot() {
            wrapper.mark_stale();
        }
        self.teardown.wait_idle().await;
        tracing::info!(total = self.free_pool.total_size(), "pool drained");
    }

    /// Stop the background reap tasks and drain the pool.
    pub async fn shutdown(self: &Arc<Self>) {
        let scheduler = self.reaper.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        self.drain().await;
    }

    /// Snapshot of the pool's current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats::new(
            self.free_pool.total_size(),
            self.free_pool.free_list_size(),
            self.free_pool.in_use_size(),
            self.free_pool.waiting(),
            self.teardown.pending(),
        )
    }

    /// Tear a claimed connection down, asynchronously when configured.
    ///
    /// The flags mirror where the connection was last tracked and whether it
    /// ever entered the total bookkeeping.
    pub(crate) async fn retire(
        self: &Arc<Self>,
        wrapper: Arc<ManagedConnection>,
        existed_in_free_pool: bool,
        decrement_total: bool,
    ) {
        if self.config.async_teardown() {
            let pool = self.clone();
            self.teardown.begin(wrapper.id());
            tokio::spawn(async move {
                pool.destroy_connection(&wrapper, existed_in_free_pool, decrement_total)
                    .await;
                pool.teardown.finish(wrapper.id());
            });
        } else {
            self.destroy_connection(&wrapper, existed_in_free_pool, decrement_total)
                .await;
        }
    }

    async fn destroy_connection(
        &self,
        wrapper: &Arc<ManagedConnection>,
        existed_in_free_pool: bool,
        decrement_total: bool,
    ) {
        self.free_pool
            .cleanup_and_destroy(&self.factory, wrapper)
            .await;
        self.free_pool
            .remove(wrapper, existed_in_free_pool, decrement_total);
        wrapper.finalize_destroyed();
    }
}
