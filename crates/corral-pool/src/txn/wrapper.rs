//! Transaction wrapper variants and enlistment state machine

use std::sync::Arc;

use corral_core::{
    BranchId, CorralError, EnlistmentPolicy, Result, Synchronization, TransactionCoordinator,
    TxContext, TxId,
};

/// Enlistment lifecycle of a transaction wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentState {
    /// No transaction work has happened yet (or the wrapper was reset)
    Uninitialized,
    /// The connection is a registered participant in a transaction
    Enlisted,
    /// The connection left its transaction and may enlist again
    Delisted,
    /// Transaction-side resources are gone; the wrapper is not reusable
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperKind {
    NoTransaction,
    Local,
    Platform,
    GlobalXa,
    AbortableXa,
}

/// Strategy object deciding how a pooled connection joins and leaves the
/// caller's transaction.
///
/// `cleanup` and `release_resources` are idempotent and legal even when
/// `enlist` was never invoked, so a connection that failed mid-acquire can
/// still be torn down through the normal path.
pub struct TransactionWrapper {
    kind: WrapperKind,
    coordinator: Arc<dyn TransactionCoordinator>,
    state: EnlistmentState,
    branch: Option<BranchId>,
    ctx: Option<TxContext>,
}

impl TransactionWrapper {
    pub(crate) fn for_policy(
        policy: EnlistmentPolicy,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) -> Self {
        let kind = match policy {
            EnlistmentPolicy::None => WrapperKind::NoTransaction,
            EnlistmentPolicy::Local => WrapperKind::Local,
            EnlistmentPolicy::Platform => WrapperKind::Platform,
            EnlistmentPolicy::GlobalXa => WrapperKind::GlobalXa,
            EnlistmentPolicy::AbortableXa => WrapperKind::AbortableXa,
        };
        Self {
            kind,
            coordinator,
            state: EnlistmentState::Uninitialized,
            branch: None,
            ctx: None,
        }
    }

    /// Current enlistment state.
    pub fn state(&self) -> EnlistmentState {
        self.state
    }

    /// Whether this wrapper is bound to the platform-native transaction
    /// rather than the coordinator's own completion protocol.
    pub fn is_platform_transactional(&self) -> bool {
        self.kind == WrapperKind::Platform
    }

    /// Whether this wrapper supports the out-of-band `abort` operation.
    pub fn is_abortable(&self) -> bool {
        self.kind == WrapperKind::AbortableXa
    }

    /// The transaction context this wrapper is currently enlisted under.
    pub fn context(&self) -> Option<TxContext> {
        self.ctx
    }

    /// Join the caller's transaction.
    ///
    /// A `NoTransaction` wrapper never enlists: the pool decided at acquire
    /// time that this connection does not share across callers.
    pub(crate) async fn enlist(&mut self, branch: BranchId, ctx: TxContext) -> Result<()> {
        if self.kind == WrapperKind::NoTransaction {
            return Ok(());
        }
        match self.state {
            EnlistmentState::Uninitialized | EnlistmentState::Delisted => {}
            EnlistmentState::Enlisted => {
                return Err(CorralError::EnlistmentFailed(format!(
                    "branch {:?} is already enlisted",
                    self.branch
                )));
            }
            EnlistmentState::Released => {
                return Err(CorralError::EnlistmentFailed(
                    "transaction wrapper has released its resources".into(),
                ));
            }
        }
        self.coordinator.enlist(branch, &ctx).await?;
        self.state = EnlistmentState::Enlisted;
        self.branch = Some(branch);
        self.ctx = Some(ctx);
        tracing::debug!(branch = branch.branch(), tx = %ctx.id(), "enlisted connection branch");
        Ok(())
    }

    /// Leave the current transaction. A no-op unless currently enlisted.
    pub(crate) async fn delist(&mut self) -> Result<()> {
        if self.kind == WrapperKind::NoTransaction || self.state != EnlistmentState::Enlisted {
            return Ok(());
        }
        let (branch, ctx) = match (self.branch, self.ctx) {
            (Some(b), Some(c)) => (b, c),
            _ => return Ok(()),
        };
        self.coordinator.delist(branch, &ctx).await?;
        self.state = EnlistmentState::Delisted;
        tracing::debug!(branch = branch.branch(), tx = %ctx.id(), "delisted connection branch");
        Ok(())
    }

    /// Register completion callbacks with the coordinator.
    ///
    /// No-op for `NoTransaction`, and for the platform-coordinated variant,
    /// whose native context already guarantees completion ordering.
    pub(crate) fn add_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()> {
        match self.kind {
            WrapperKind::NoTransaction | WrapperKind::Platform => Ok(()),
            _ => {
                let ctx = self.ctx.as_ref().ok_or_else(|| {
                    CorralError::NotSupported(
                        "no transaction context to register a synchronization with".into(),
                    )
                })?;
                self.coordinator.register_synchronization(ctx, sync)
            }
        }
    }

    /// Reset the wrapper for reuse by the next caller.
    ///
    /// Delists first when still enlisted; a delist failure propagates so the
    /// pool destroys the connection instead of reusing it.
    pub(crate) async fn cleanup(&mut self) -> Result<()> {
        self.delist().await?;
        self.branch = None;
        self.ctx = None;
        if self.state != EnlistmentState::Released {
            self.state = EnlistmentState::Uninitialized;
        }
        Ok(())
    }

    /// Release transaction-side resources permanently.
    ///
    /// Called on the destroy path; a still-enlisted branch is delisted
    /// best-effort because the connection is going away either way.
    pub(crate) async fn release_resources(&mut self) -> Result<()> {
        if self.state == EnlistmentState::Enlisted
            && let (Some(branch), Some(ctx)) = (self.branch, self.ctx)
            && let Err(e) = self.coordinator.delist(branch, &ctx).await
        {
            tracing::debug!(branch = branch.branch(), error = %e, "delist during resource release failed");
        }
        self.branch = None;
        self.ctx = None;
        self.state = EnlistmentState::Released;
        Ok(())
    }

    /// Out-of-band branch abort, invoked by a recovery/supervisor component
    /// when the coordinator has unilaterally terminated `tx`.
    ///
    /// Forces the wrapper into its released state regardless of the current
    /// enlistment state; no delist is sent back to the coordinator, which
    /// already considers the branch dead.
    pub(crate) async fn abort(&mut self, tx: TxId) -> Result<()> {
        if self.kind != WrapperKind::AbortableXa {
            return Err(CorralError::NotSupported(
                "transaction wrapper does not support branch abort".into(),
            ));
        }
        if let Some(ctx) = self.ctx
            && ctx.id() != tx
        {
            tracing::warn!(
                enlisted_tx = %ctx.id(),
                aborted_tx = %tx,
                "branch abort for a different transaction; forcing cleanup anyway"
            );
        }
        self.branch = None;
        self.ctx = None;
        self.state = EnlistmentState::Released;
        Ok(())
    }
}
