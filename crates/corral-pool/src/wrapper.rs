//! Managed connection wrapper and lifecycle state

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;

use corral_core::{PhysicalConnection, SharingScope};

use crate::txn::TransactionWrapper;

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the free list, available for reuse
    Free,
    /// Checked out to a shareable request
    Shared,
    /// Checked out exclusively
    InUse,
    /// Force-abort in progress, teardown not yet complete
    AbortPending,
    /// Terminal: removed from every tracking structure
    Destroyed,
}

/// Why a managed connection was (or will be) destroyed.
///
/// The cause travels with the connection so that handle operations racing a
/// forced teardown can tell a transaction-time-limit cleanup apart from any
/// other destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyCause {
    /// The in-use time limit forced the connection out from under a caller
    MaxInUseTimeout,
    /// A recovery component force-failed the connection's transaction branch
    BranchAborted,
    /// The connection exceeded its maximum lifetime
    AgedTimeout,
    /// The idle reaper retired the connection
    IdleTimeout,
    /// Transaction or driver cleanup failed on release
    CleanupFailed,
    /// Transaction enlistment failed during acquire
    EnlistmentFailed,
    /// A fatal driver error was reported for the connection
    Stale,
    /// The pool was drained
    Drained,
}

impl DestroyCause {
    /// Whether this destruction was a forced cleanup racing a live handle.
    /// Handle operations absorb `IllegalHandleState` for these causes and
    /// propagate it for every other one.
    pub fn is_forced_cleanup(&self) -> bool {
        matches!(self, Self::MaxInUseTimeout | Self::BranchAborted)
    }
}

struct WrapperState {
    state: ConnectionState,
    last_used_at: Instant,
    in_use_since: Option<Instant>,
    stale: bool,
    destroy_cause: Option<DestroyCause>,
    /// Set by whichever path claims the teardown; all later claimers and
    /// the free-list return back off. Guarantees removal happens once.
    teardown_claimed: bool,
    /// Capacity permit held while the connection is checked out. Returning
    /// or destroying the connection drops the permit, waking one waiter.
    permit: Option<OwnedSemaphorePermit>,
}

/// One physical connection owned by the pool, together with its lifecycle
/// state and the transaction wrapper currently attached to it.
///
/// A managed connection lives in exactly one pool bucket (free list or
/// in-use map) or is mid-transition under the pool lock. `Destroyed` is
/// terminal; a destroyed connection never re-enters the free list.
pub struct ManagedConnection {
    id: u64,
    physical: Arc<dyn PhysicalConnection>,
    signature: u64,
    sharing: SharingScope,
    created_at: Instant,
    state: Mutex<WrapperState>,
    txn: tokio::sync::Mutex<TransactionWrapper>,
}

impl ManagedConnection {
    pub(crate) fn new(
        id: u64,
        physical: Arc<dyn PhysicalConnection>,
        signature: u64,
        sharing: SharingScope,
        txn: TransactionWrapper,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            physical,
            signature,
            sharing,
            created_at: now,
            state: Mutex::new(WrapperState {
                state: ConnectionState::Free,
                last_used_at: now,
                in_use_since: None,
                stale: false,
                destroy_cause: None,
                teardown_claimed: false,
                permit: None,
            }),
            txn: tokio::sync::Mutex::new(txn),
        }
    }

    /// Pool-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying physical connection.
    pub fn physical(&self) -> Arc<dyn PhysicalConnection> {
        self.physical.clone()
    }

    /// Cached request/identity signature the connection was created under.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Sharing scope the connection was created for.
    pub fn sharing(&self) -> SharingScope {
        self.sharing
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Why the connection was destroyed, once it has been.
    pub fn destroy_cause(&self) -> Option<DestroyCause> {
        self.state.lock().destroy_cause
    }

    /// Whether the connection has reached a terminal state.
    pub fn is_destroyed(&self) -> bool {
        matches!(
            self.state.lock().state,
            ConnectionState::AbortPending | ConnectionState::Destroyed
        )
    }

    /// Mark the connection unusable; it is destroyed on its next release.
    pub fn mark_stale(&self) {
        self.state.lock().stale = true;
    }

    /// Whether a fatal driver error was reported for this connection.
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// How long the connection has existed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// How long the connection has been idle since its last use.
    pub fn idle_elapsed(&self) -> Duration {
        self.state.lock().last_used_at.elapsed()
    }

    /// How long the connection has been checked out, if it currently is.
    pub fn in_use_elapsed(&self) -> Option<Duration> {
        self.state.lock().in_use_since.map(|t| t.elapsed())
    }

    /// Whether the connection exceeded the configured maximum lifetime.
    pub fn has_aged_out(&self, aged_timeout: Option<Duration>) -> bool {
        aged_timeout.is_some_and(|limit| self.created_at.elapsed() > limit)
    }

    pub(crate) fn txn(&self) -> &tokio::sync::Mutex<TransactionWrapper> {
        &self.txn
    }

    /// Transition to checked-out and take ownership of the capacity permit.
    pub(crate) fn mark_checked_out(&self, permit: OwnedSemaphorePermit) {
        let mut s = self.state.lock();
        s.state = match self.sharing {
            SharingScope::Shareable => ConnectionState::Shared,
            SharingScope::Unshareable => ConnectionState::InUse,
        };
        let now = Instant::now();
        s.last_used_at = now;
        s.in_use_since = Some(now);
        s.permit = Some(permit);
    }

    /// Transition back to `Free`, releasing the capacity permit to the
    /// caller (dropped after the connection is back in the free list).
    ///
    /// Returns `None` when a forced teardown has already claimed the
    /// connection; it must not re-enter the free list then.
    pub(crate) fn try_mark_free(&self) -> Option<OwnedSemaphorePermit> {
        let mut s = self.state.lock();
        if s.teardown_claimed {
            return None;
        }
        match s.state {
            ConnectionState::Shared | ConnectionState::InUse => {
                s.state = ConnectionState::Free;
                s.last_used_at = Instant::now();
                s.in_use_since = None;
                s.permit.take()
            }
            _ => None,
        }
    }

    /// Claim this connection for teardown, transitioning to `Destroyed`.
    ///
    /// Exactly one claim succeeds over the connection's lifetime; later
    /// claims return `None` and the claimer backs off. The inner option is
    /// the capacity permit, present when the connection was checked out.
    pub(crate) fn claim_for_destroy(
        &self,
        cause: DestroyCause,
    ) -> Option<Option<OwnedSemaphorePermit>> {
        let mut s = self.state.lock();
        if s.teardown_claimed {
            return None;
        }
        s.teardown_claimed = true;
        s.state = ConnectionState::Destroyed;
        s.destroy_cause.get_or_insert(cause);
        Some(s.permit.take())
    }

    /// Claim a checked-out connection for a forced abort.
    ///
    /// Only the first claimer wins; every later caller (including the
    /// handle's own release) observes the claim and backs off. Returns the
    /// capacity permit on success.
    pub(crate) fn begin_force_abort(&self, cause: DestroyCause) -> Option<OwnedSemaphorePermit> {
        let mut s = self.state.lock();
        if s.teardown_claimed {
            return None;
        }
        match s.state {
            ConnectionState::Shared | ConnectionState::InUse => {
                s.teardown_claimed = true;
                s.state = ConnectionState::AbortPending;
                s.destroy_cause = Some(cause);
                s.permit.take()
            }
            _ => None,
        }
    }

    /// Settle an `AbortPending` connection into its terminal state once
    /// teardown has completed.
    pub(crate) fn finalize_destroyed(&self) {
        self.state.lock().state = ConnectionState::Destroyed;
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("state", &s.state)
            .field("sharing", &self.sharing)
            .field("stale", &s.stale)
            .field("destroy_cause", &s.destroy_cause)
            .finish()
    }
}
