//! Transaction coordinator capability

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// Identifier of a caller's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(Uuid);

impl TxId {
    /// Create a fresh transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The transaction context a caller is operating in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    id: TxId,
    platform: bool,
}

impl TxContext {
    /// Create a context for a coordinator-managed transaction.
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            platform: false,
        }
    }

    /// Create a context bound to the platform-native transaction.
    pub fn platform(id: TxId) -> Self {
        Self { id, platform: true }
    }

    /// Get the transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Whether this context is bound to the platform-native transaction.
    pub fn is_platform(&self) -> bool {
        self.platform
    }
}

/// Identifies one branch of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId {
    tx: TxId,
    branch: u64,
}

impl BranchId {
    /// Create a branch id within the given transaction.
    pub fn new(tx: TxId, branch: u64) -> Self {
        Self { tx, branch }
    }

    /// Get the owning transaction id.
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Get the branch qualifier.
    pub fn branch(&self) -> u64 {
        self.branch
    }
}

/// Pre/post-completion callbacks registered with the coordinator.
pub trait Synchronization: Send + Sync {
    /// Invoked before transaction completion begins.
    fn before_completion(&self);

    /// Invoked after the transaction completed.
    fn after_completion(&self, committed: bool);
}

/// External coordinator the pool enlists connection branches with.
///
/// The pool never implements the two-phase-commit protocol itself; it only
/// registers and deregisters participants through this capability.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync + 'static {
    /// The transaction context of the calling task, if any.
    fn current_context(&self) -> Option<TxContext>;

    /// Register a branch as a participant in the given transaction.
    async fn enlist(&self, branch: BranchId, ctx: &TxContext) -> Result<()>;

    /// Deregister a previously enlisted branch.
    async fn delist(&self, branch: BranchId, ctx: &TxContext) -> Result<()>;

    /// Register completion callbacks for the given transaction.
    fn register_synchronization(
        &self,
        ctx: &TxContext,
        sync: Box<dyn Synchronization>,
    ) -> Result<()>;
}

#[async_trait]
impl<T: TransactionCoordinator> TransactionCoordinator for Arc<T> {
    fn current_context(&self) -> Option<TxContext> {
        (**self).current_context()
    }

    async fn enlist(&self, branch: BranchId, ctx: &TxContext) -> Result<()> {
        (**self).enlist(branch, ctx).await
    }

    async fn delist(&self, branch: BranchId, ctx: &TxContext) -> Result<()> {
        (**self).delist(branch, ctx).await
    }

    fn register_synchronization(
        &self,
        ctx: &TxContext,
        sync: Box<dyn Synchronization>,
    ) -> Result<()> {
        (**self).register_synchronization(ctx, sync)
    }
}
