//! Tests for pool manager functionality

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use corral_core::{
    BranchId, ConnectionFactory, ConnectionRequest, CorralError, EnlistmentPolicy, Identity,
    PhysicalConnection, Result, SharingScope, Synchronization, TransactionCoordinator, TxContext,
    TxId,
};

use crate::config::PoolConfig;
use crate::pool::manager::PoolManager;
use crate::pool::stats::PoolStats;
use crate::wrapper::ConnectionState;

/// Mock physical connection for testing
struct MockConnection {
    #[allow(dead_code)]
    id: usize,
    principal: String,
    valid: AtomicBool,
    fail_cleanup: bool,
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn resource_name(&self) -> &str {
        &self.principal
    }

    async fn cleanup(&self) -> Result<()> {
        if self.fail_cleanup {
            return Err(CorralError::Other("cleanup failed".into()));
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

/// Mock factory that counts connections created and destroyed
struct MockFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    fail_cleanup: AtomicBool,
}

impl MockFactory {
    fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
        }
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(
        &self,
        _request: &ConnectionRequest,
        identity: &Identity,
    ) -> Result<Arc<dyn PhysicalConnection>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CorralError::Other("backend unavailable".into()));
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            id,
            principal: identity.principal().to_string(),
            valid: AtomicBool::new(true),
            fail_cleanup: self.fail_cleanup.load(Ordering::SeqCst),
        }))
    }

    async fn destroy(&self, _connection: Arc<dyn PhysicalConnection>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(CorralError::TeardownFailed("close failed".into()));
        }
        Ok(())
    }
}

/// Mock coordinator with a settable caller context
struct MockCoordinator {
    ctx: Mutex<Option<TxContext>>,
    enlisted: AtomicUsize,
    delisted: AtomicUsize,
    syncs: AtomicUsize,
    fail_enlist: AtomicBool,
}

impl MockCoordinator {
    fn new() -> Self {
        Self {
            ctx: Mutex::new(None),
            enlisted: AtomicUsize::new(0),
            delisted: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            fail_enlist: AtomicBool::new(false),
        }
    }

    fn set_context(&self, ctx: Option<TxContext>) {
        *self.ctx.lock() = ctx;
    }
}

#[async_trait]
impl TransactionCoordinator for MockCoordinator {
    fn current_context(&self) -> Option<TxContext> {
        *self.ctx.lock()
    }

    async fn enlist(&self, _branch: BranchId, _ctx: &TxContext) -> Result<()> {
        if self.fail_enlist.load(Ordering::SeqCst) {
            return Err(CorralError::Other("coordinator rejected branch".into()));
        }
        self.enlisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delist(&self, _branch: BranchId, _ctx: &TxContext) -> Result<()> {
        self.delisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_synchronization(
        &self,
        _ctx: &TxContext,
        _sync: Box<dyn Synchronization>,
    ) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoopSync;

impl Synchronization for NoopSync {
    fn before_completion(&self) {}
    fn after_completion(&self, _committed: bool) {}
}

struct TestPool {
    pool: Arc<PoolManager>,
    factory: Arc<MockFactory>,
    coordinator: Arc<MockCoordinator>,
}

fn test_pool(config: PoolConfig) -> TestPool {
    let factory = Arc::new(MockFactory::new());
    let coordinator = Arc::new(MockCoordinator::new());
    let pool = PoolManager::new_unscheduled(
        config,
        factory.clone() as Arc<dyn ConnectionFactory>,
        coordinator.clone() as Arc<dyn TransactionCoordinator>,
    );
    TestPool {
        pool,
        factory,
        coordinator,
    }
}

fn request() -> ConnectionRequest {
    ConnectionRequest::new(SharingScope::Unshareable, EnlistmentPolicy::None)
}

fn identity() -> Identity {
    Identity::new("app")
}

fn assert_invariant(pool: &Arc<PoolManager>) {
    let stats = pool.stats();
    assert!(
        stats.free() <= stats.total(),
        "free list ({}) exceeded total size ({})",
        stats.free(),
        stats.total()
    );
}

// =============================================================================
// PoolConfig tests
// =============================================================================

#[test]
fn test_pool_config_creation() {
    let config = PoolConfig::new(2, 10);
    assert_eq!(config.min_size(), 2);
    assert_eq!(config.max_size(), 10);
    assert_eq!(config.acquire_timeout(), Duration::from_millis(30_000));
    assert_eq!(config.reap_interval(), Duration::from_millis(180_000));
    assert_eq!(config.unused_timeout(), Duration::from_millis(1_800_000));
    assert!(config.aged_timeout().is_none());
    assert!(config.max_in_use_time().is_none());
    assert!(config.async_teardown());
}

#[test]
fn test_pool_config_with_timeouts() {
    let config = PoolConfig::new(1, 5)
        .with_acquire_timeout_ms(5000)
        .with_unused_timeout_ms(60_000)
        .with_aged_timeout_ms(3_600_000)
        .with_max_in_use_time_ms(120_000)
        .with_async_teardown(false);

    assert_eq!(config.acquire_timeout(), Duration::from_millis(5000));
    assert_eq!(config.unused_timeout(), Duration::from_millis(60_000));
    assert_eq!(config.aged_timeout(), Some(Duration::from_millis(3_600_000)));
    assert_eq!(
        config.max_in_use_time(),
        Some(Duration::from_millis(120_000))
    );
    assert!(!config.async_teardown());
}

#[test]
#[should_panic(expected = "max_size must be greater than 0")]
fn test_pool_config_invalid_max_size() {
    PoolConfig::new(0, 0);
}

#[test]
#[should_panic(expected = "min_size (10) cannot exceed max_size (5)")]
fn test_pool_config_min_exceeds_max() {
    PoolConfig::new(10, 5);
}

#[test]
fn test_pool_config_serialization() {
    let config = PoolConfig::new(2, 10)
        .with_acquire_timeout_ms(5000)
        .with_aged_timeout_ms(3_600_000);

    let json = serde_json::to_string(&config).expect("serialize");
    let deserialized: PoolConfig = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(deserialized.min_size(), 2);
    assert_eq!(deserialized.max_size(), 10);
    assert_eq!(deserialized.acquire_timeout(), Duration::from_millis(5000));
    assert_eq!(
        deserialized.aged_timeout(),
        Some(Duration::from_millis(3_600_000))
    );
}

// =============================================================================
// PoolStats tests
// =============================================================================

#[test]
fn test_pool_stats_accessors() {
    let stats = PoolStats::new(10, 6, 4, 2, 1);
    assert_eq!(stats.total(), 10);
    assert_eq!(stats.free(), 6);
    assert_eq!(stats.in_use(), 4);
    assert_eq!(stats.waiting(), 2);
    assert_eq!(stats.pending_teardown(), 1);
}

#[test]
fn test_pool_stats_utilization() {
    let stats = PoolStats::new(10, 5, 5, 0, 0);
    assert!((stats.utilization() - 0.5).abs() < 0.001);

    let empty = PoolStats::default();
    assert!((empty.utilization() - 0.0).abs() < 0.001);
    assert!(!empty.is_full());

    let full = PoolStats::new(4, 0, 4, 0, 0);
    assert!(full.is_full());
}

// =============================================================================
// Acquire / release
// =============================================================================

#[tokio::test]
async fn test_acquire_creates_and_release_returns_to_free_list() {
    let t = test_pool(PoolConfig::new(0, 5).with_async_teardown(false));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_eq!(handle.connection().expect("connection").resource_name(), "app");
    let stats = t.pool.stats();
    assert_eq!(stats.total(), 1);
    assert_eq!(stats.in_use(), 1);
    assert_eq!(stats.free(), 0);
    assert_invariant(&t.pool);

    handle.close().await.expect("close");
    let stats = t.pool.stats();
    assert_eq!(stats.total(), 1);
    assert_eq!(stats.in_use(), 0);
    assert_eq!(stats.free(), 1);
    assert_invariant(&t.pool);

    // the idle connection is reused, not recreated
    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_eq!(t.factory.created(), 1);
    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_free_list_never_exceeds_total() {
    let t = test_pool(PoolConfig::new(0, 3).with_async_teardown(false));

    let h1 = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_invariant(&t.pool);
    let h2 = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_invariant(&t.pool);
    h1.close().await.expect("close");
    assert_invariant(&t.pool);
    let h3 = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_invariant(&t.pool);
    h2.close().await.expect("close");
    assert_invariant(&t.pool);
    h3.close().await.expect("close");
    assert_invariant(&t.pool);
    t.pool.drain().await;
    assert_invariant(&t.pool);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_acquires_get_distinct_connections() {
    let t = test_pool(PoolConfig::new(0, 8).with_async_teardown(false));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = t.pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.acquire(request(), identity()).await.expect("acquire")
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.expect("join"));
    }

    let mut ids: Vec<u64> = handles
        .iter()
        .map(|h| h.connection_id().expect("bound"))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8, "two handles shared one connection");

    for handle in handles {
        handle.close().await.expect("close");
    }
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let t = test_pool(
        PoolConfig::new(0, 1)
            .with_acquire_timeout_ms(100)
            .with_async_teardown(false),
    );

    let held = t.pool.acquire(request(), identity()).await.expect("acquire");
    let err = t.pool.acquire(request(), identity()).await.unwrap_err();
    assert!(matches!(err, CorralError::PoolExhausted(_)));

    held.close().await.expect("close");
}

#[tokio::test]
async fn test_blocked_acquire_proceeds_after_release() {
    let t = test_pool(
        PoolConfig::new(0, 1)
            .with_acquire_timeout_ms(2000)
            .with_async_teardown(false),
    );

    let held = t.pool.acquire(request(), identity()).await.expect("acquire");

    let pool = t.pool.clone();
    let blocked = tokio::spawn(async move { pool.acquire(request(), identity()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    held.close().await.expect("close");

    let handle = blocked
        .await
        .expect("join")
        .expect("blocked acquire succeeds after release");
    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_create_failure_surfaces_and_leaks_nothing() {
    let t = test_pool(PoolConfig::new(0, 1).with_async_teardown(false));
    t.factory.fail_create.store(true, Ordering::SeqCst);

    let err = t.pool.acquire(request(), identity()).await.unwrap_err();
    assert!(matches!(err, CorralError::ConnectionCreateFailed(_)));
    assert_eq!(t.pool.stats().total(), 0);

    // capacity was not leaked by the failed attempt
    t.factory.fail_create.store(false, Ordering::SeqCst);
    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_signature_match_prefers_same_identity() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));

    let alice = t
        .pool
        .acquire(request(), Identity::new("alice"))
        .await
        .expect("acquire");
    let bob = t
        .pool
        .acquire(request(), Identity::new("bob"))
        .await
        .expect("acquire");
    alice.close().await.expect("close");
    bob.close().await.expect("close");

    // bob's connection is the most recently used, but the signature match
    // picks alice's connection for alice
    let handle = t
        .pool
        .acquire(request(), Identity::new("alice"))
        .await
        .expect("acquire");
    assert_eq!(
        handle.connection().expect("connection").resource_name(),
        "alice"
    );
    assert_eq!(t.factory.created(), 2);
    handle.close().await.expect("close");
}

// =============================================================================
// Transaction enlistment
// =============================================================================

#[tokio::test]
async fn test_no_transaction_policy_never_enlists() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));
    t.coordinator.set_context(Some(TxContext::new(TxId::new())));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    handle.close().await.expect("close");

    assert_eq!(t.coordinator.enlisted.load(Ordering::SeqCst), 0);
    assert_eq!(t.coordinator.delisted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_global_xa_enlists_on_acquire_and_delists_on_release() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));
    t.coordinator.set_context(Some(TxContext::new(TxId::new())));

    let xa_request = ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::GlobalXa);
    let handle = t
        .pool
        .acquire(xa_request, identity())
        .await
        .expect("acquire");
    assert_eq!(t.coordinator.enlisted.load(Ordering::SeqCst), 1);

    handle.close().await.expect("close");
    assert_eq!(t.coordinator.delisted.load(Ordering::SeqCst), 1);

    let stats = t.pool.stats();
    assert_eq!(stats.free(), 1);
}

#[tokio::test]
async fn test_enlist_failure_destroys_wrapper_without_leaking_capacity() {
    let t = test_pool(PoolConfig::new(0, 1).with_async_teardown(false));
    t.coordinator.set_context(Some(TxContext::new(TxId::new())));
    t.coordinator.fail_enlist.store(true, Ordering::SeqCst);

    let xa_request = ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::GlobalXa);
    let err = t
        .pool
        .acquire(xa_request.clone(), identity())
        .await
        .unwrap_err();
    assert!(matches!(err, CorralError::EnlistmentFailed(_)));

    // the failed wrapper was destroyed and never entered the pool counts
    assert_eq!(t.pool.stats().total(), 0);
    assert_eq!(t.pool.stats().free(), 0);
    assert_eq!(t.factory.destroyed(), 1);

    // capacity is still available
    t.coordinator.fail_enlist.store(false, Ordering::SeqCst);
    let handle = t
        .pool
        .acquire(xa_request, identity())
        .await
        .expect("acquire");
    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_handle_registers_synchronization_through_wrapper() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));
    t.coordinator.set_context(Some(TxContext::new(TxId::new())));

    let xa_request = ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::GlobalXa);
    let handle = t
        .pool
        .acquire(xa_request, identity())
        .await
        .expect("acquire");

    handle
        .add_synchronization(Box::new(NoopSync))
        .await
        .expect("add_synchronization");
    assert_eq!(t.coordinator.syncs.load(Ordering::SeqCst), 1);

    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_recovery_abort_force_fails_enlisted_branches() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));
    let ctx = TxContext::new(TxId::new());
    t.coordinator.set_context(Some(ctx));

    let abortable =
        ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::AbortableXa);
    let doomed = t
        .pool
        .acquire(abortable, identity())
        .await
        .expect("acquire");

    // a connection in a different transaction is left alone
    t.coordinator
        .set_context(Some(TxContext::new(TxId::new())));
    let other = t
        .pool
        .acquire(
            ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::AbortableXa),
            identity(),
        )
        .await
        .expect("acquire");

    t.pool.abort_branches(ctx.id()).await;

    let stats = t.pool.stats();
    assert_eq!(stats.total(), 1);
    assert_eq!(t.factory.destroyed(), 1);
    // the abort path never delists with the coordinator
    assert_eq!(t.coordinator.delisted.load(Ordering::SeqCst), 0);

    // absorbed on release, like any forced cleanup
    doomed.close().await.expect("close absorbed");
    other.close().await.expect("close");
}

// =============================================================================
// Cleanup, staleness, aging
// =============================================================================

#[tokio::test]
async fn test_failed_cleanup_destroys_instead_of_pooling() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));
    t.factory.fail_cleanup.store(true, Ordering::SeqCst);

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    handle.close().await.expect("close");

    let stats = t.pool.stats();
    assert_eq!(stats.total(), 0);
    assert_eq!(stats.free(), 0);
    assert_eq!(t.factory.destroyed(), 1);
}

#[tokio::test]
async fn test_stale_connection_destroyed_on_release() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    let id = handle.connection_id().expect("bound");
    t.pool.fatal_error_notification(id).await;
    handle.close().await.expect("close");

    assert_eq!(t.pool.stats().total(), 0);
    assert_eq!(t.factory.destroyed(), 1);
}

#[tokio::test]
async fn test_aged_connection_destroyed_on_release() {
    let t = test_pool(
        PoolConfig::new(0, 2)
            .with_aged_timeout_ms(30)
            .with_async_teardown(false),
    );

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.close().await.expect("close");

    assert_eq!(t.pool.stats().total(), 0);
    assert_eq!(t.factory.destroyed(), 1);
}

// =============================================================================
// Background reap tasks
// =============================================================================

#[tokio::test]
async fn test_idle_reap_respects_min_size() {
    let t = test_pool(
        PoolConfig::new(1, 5)
            .with_unused_timeout_ms(30)
            .with_async_teardown(false),
    );

    let h1 = t.pool.acquire(request(), identity()).await.expect("acquire");
    let h2 = t.pool.acquire(request(), identity()).await.expect("acquire");
    let h3 = t.pool.acquire(request(), identity()).await.expect("acquire");
    h1.close().await.expect("close");
    h2.close().await.expect("close");
    h3.close().await.expect("close");
    assert_eq!(t.pool.stats().free(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    t.pool.execute_idle_reap_task().await;

    let stats = t.pool.stats();
    assert_eq!(stats.total(), 1, "reap must leave the minimum pool size");
    assert_eq!(stats.free(), 1);
    assert_eq!(t.factory.destroyed(), 2);
}

#[tokio::test]
async fn test_aged_timeout_task_reaps_idle_connections() {
    let t = test_pool(
        PoolConfig::new(0, 5)
            .with_aged_timeout_ms(30)
            .with_async_teardown(false),
    );

    let h1 = t.pool.acquire(request(), identity()).await.expect("acquire");
    let h2 = t.pool.acquire(request(), identity()).await.expect("acquire");
    h1.close().await.expect("close");
    h2.close().await.expect("close");

    tokio::time::sleep(Duration::from_millis(50)).await;
    t.pool.execute_aged_timeout_task().await;

    assert_eq!(t.pool.stats().total(), 0);
    assert_eq!(t.factory.destroyed(), 2);
}

#[tokio::test]
async fn test_background_scheduler_reaps_idle_connections() {
    let factory = Arc::new(MockFactory::new());
    let coordinator = Arc::new(MockCoordinator::new());
    let pool = PoolManager::new(
        PoolConfig::new(0, 2)
            .with_reap_interval_ms(40)
            .with_unused_timeout_ms(10)
            .with_async_teardown(false),
        factory.clone() as Arc<dyn ConnectionFactory>,
        coordinator as Arc<dyn TransactionCoordinator>,
    );

    let handle = pool.acquire(request(), identity()).await.expect("acquire");
    handle.close().await.expect("close");
    assert_eq!(pool.stats().free(), 1);

    // wait for the scheduled idle reap to run
    for _ in 0..100 {
        if pool.stats().total() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.stats().total(), 0);
    assert_eq!(factory.destroyed(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_max_in_use_task_destroys_only_over_limit() {
    let t = test_pool(
        PoolConfig::new(0, 5)
            .with_max_in_use_time_ms(50)
            .with_async_teardown(false),
    );

    let old = t.pool.acquire(request(), identity()).await.expect("acquire");
    tokio::time::sleep(Duration::from_millis(80)).await;
    let young = t.pool.acquire(request(), identity()).await.expect("acquire");

    t.pool.execute_max_in_use_task().await;

    let stats = t.pool.stats();
    assert_eq!(stats.total(), 1, "only the over-limit connection goes away");
    assert_eq!(stats.in_use(), 1);
    assert_eq!(t.factory.destroyed(), 1);

    // releasing the aborted handle is absorbed, not an error
    old.close().await.expect("close absorbed");
    young.close().await.expect("close");
    assert_eq!(t.pool.stats().free(), 1);
}

#[tokio::test]
async fn test_max_in_use_task_uses_abort_for_abortable_wrappers() {
    let t = test_pool(
        PoolConfig::new(0, 2)
            .with_max_in_use_time_ms(30)
            .with_async_teardown(false),
    );
    t.coordinator.set_context(Some(TxContext::new(TxId::new())));

    let abortable =
        ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::AbortableXa);
    let handle = t
        .pool
        .acquire(abortable, identity())
        .await
        .expect("acquire");
    assert_eq!(t.coordinator.enlisted.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    t.pool.execute_max_in_use_task().await;

    // the abort path bypasses the coordinator: no delist was sent
    assert_eq!(t.coordinator.delisted.load(Ordering::SeqCst), 0);
    assert_eq!(t.factory.destroyed(), 1);
    assert_eq!(t.pool.stats().total(), 0);

    handle.close().await.expect("close absorbed");
}

// =============================================================================
// Asynchronous teardown
// =============================================================================

#[tokio::test]
async fn test_async_teardown_failure_still_corrects_counters() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(true));
    t.factory.fail_cleanup.store(true, Ordering::SeqCst);
    t.factory.fail_destroy.store(true, Ordering::SeqCst);

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    handle.close().await.expect("close");

    // wait for the background worker to finish
    for _ in 0..100 {
        let stats = t.pool.stats();
        if stats.pending_teardown() == 0 && stats.total() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = t.pool.stats();
    assert_eq!(stats.total(), 0, "driver destroy error must not leak counts");
    assert_eq!(stats.free(), 0);
    assert_eq!(stats.pending_teardown(), 0);
    assert_eq!(t.factory.destroyed(), 1);
}

// =============================================================================
// Park / reassociate
// =============================================================================

#[tokio::test]
async fn test_park_and_reassociate_roundtrip() {
    let t = test_pool(PoolConfig::new(0, 2).with_async_teardown(false));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    let id = handle.connection_id().expect("bound");

    handle.park().expect("park");
    assert!(handle.is_parked());
    let err = handle.connection().unwrap_err();
    assert!(matches!(err, CorralError::IllegalHandleState(_)));

    // a parked connection stays checked out
    assert_eq!(t.pool.stats().in_use(), 1);

    handle.reassociate().await.expect("reassociate");
    assert_eq!(handle.connection_id(), Some(id));
    assert!(handle.connection().is_ok());

    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_reassociate_after_forced_abort_gets_fresh_connection() {
    let t = test_pool(
        PoolConfig::new(0, 1)
            .with_max_in_use_time_ms(30)
            .with_async_teardown(false),
    );

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    let original = handle.connection_id().expect("bound");
    handle.park().expect("park");

    tokio::time::sleep(Duration::from_millis(50)).await;
    t.pool.execute_max_in_use_task().await;
    assert_eq!(t.factory.destroyed(), 1);

    // absorbed: the forced cleanup replaced the connection underneath
    handle.reassociate().await.expect("reassociate");
    let fresh = handle.connection_id().expect("bound");
    assert_ne!(original, fresh);

    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_closing_a_parked_handle_releases_its_connection() {
    let t = test_pool(PoolConfig::new(0, 1).with_async_teardown(false));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    handle.park().expect("park");
    handle.close().await.expect("close");

    let stats = t.pool.stats();
    assert_eq!(stats.in_use(), 0);
    assert_eq!(stats.free(), 1);
}

// =============================================================================
// Drain
// =============================================================================

#[tokio::test]
async fn test_drain_blocks_acquires_and_empties_free_list() {
    let t = test_pool(PoolConfig::new(0, 3).with_async_teardown(false));

    let h1 = t.pool.acquire(request(), identity()).await.expect("acquire");
    let h2 = t.pool.acquire(request(), identity()).await.expect("acquire");
    h1.close().await.expect("close");

    t.pool.drain().await;

    assert_eq!(t.pool.stats().free(), 0);
    let err = t.pool.acquire(request(), identity()).await.unwrap_err();
    assert!(matches!(err, CorralError::PoolExhausted(_)));

    // the still-held connection is destroyed when it comes back
    h2.close().await.expect("close");
    assert_eq!(t.pool.stats().total(), 0);
    assert_eq!(t.factory.destroyed(), 2);
}

// =============================================================================
// Wrapper state
// =============================================================================

#[tokio::test]
async fn test_released_wrapper_is_free_and_reusable() {
    let t = test_pool(PoolConfig::new(0, 1).with_async_teardown(false));

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    let wrapper = handle.wrapper().expect("wrapper");
    assert_eq!(wrapper.state(), ConnectionState::InUse);

    handle.close().await.expect("close");
    assert_eq!(wrapper.state(), ConnectionState::Free);

    let handle = t.pool.acquire(request(), identity()).await.expect("acquire");
    assert_eq!(handle.connection_id(), Some(wrapper.id()));
    handle.close().await.expect("close");
}

#[tokio::test]
async fn test_shareable_request_marks_wrapper_shared() {
    let t = test_pool(PoolConfig::new(0, 1).with_async_teardown(false));

    let shareable = ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::None);
    let handle = t.pool.acquire(shareable, identity()).await.expect("acquire");
    let wrapper = handle.wrapper().expect("wrapper");
    assert_eq!(wrapper.state(), ConnectionState::Shared);
    handle.close().await.expect("close");
}
