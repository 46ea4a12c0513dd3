//! Caller-facing connection handle

use std::sync::Arc;

use parking_lot::Mutex;

use corral_core::{
    ConnectionRequest, CorralError, Identity, PhysicalConnection, Result, Synchronization,
};

use crate::pool::PoolManager;
use crate::wrapper::ManagedConnection;

pub(crate) enum HandleBinding {
    Bound(Arc<ManagedConnection>),
    Parked(Arc<ManagedConnection>),
    Closed,
}

/// A caller's lease on a pooled physical connection.
///
/// Handles delegate close, park, and reassociate back to the owning pool.
/// A handle may be parked across a transaction boundary and later
/// reassociated, possibly with a different physical connection. Once closed,
/// a handle rejects further use.
pub struct ConnectionHandle {
    pool: Arc<PoolManager>,
    request: ConnectionRequest,
    identity: Identity,
    binding: Mutex<HandleBinding>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        pool: Arc<PoolManager>,
        request: ConnectionRequest,
        identity: Identity,
        wrapper: Arc<ManagedConnection>,
    ) -> Self {
        Self {
            pool,
            request,
            identity,
            binding: Mutex::new(HandleBinding::Bound(wrapper)),
        }
    }

    /// The physical connection this handle is currently bound to.
    pub fn connection(&self) -> Result<Arc<dyn PhysicalConnection>> {
        match &*self.binding.lock() {
            HandleBinding::Bound(w) => Ok(w.physical()),
            HandleBinding::Parked(_) => Err(CorralError::IllegalHandleState(
                "handle is parked; reassociate it before use".into(),
            )),
            HandleBinding::Closed => Err(CorralError::IllegalHandleState(
                "handle is closed".into(),
            )),
        }
    }

    /// Pool-unique id of the bound connection, if any.
    pub fn connection_id(&self) -> Option<u64> {
        match &*self.binding.lock() {
            HandleBinding::Bound(w) | HandleBinding::Parked(w) => Some(w.id()),
            HandleBinding::Closed => None,
        }
    }

    /// The request this handle was acquired for.
    pub fn request(&self) -> &ConnectionRequest {
        &self.request
    }

    /// The identity this handle was acquired under.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(&*self.binding.lock(), HandleBinding::Closed)
    }

    /// Whether the handle is currently parked.
    pub fn is_parked(&self) -> bool {
        matches!(&*self.binding.lock(), HandleBinding::Parked(_))
    }

    /// Detach from the physical connection to survive a transaction
    /// boundary. The connection stays checked out to this handle.
    pub fn park(&self) -> Result<()> {
        self.pool.park_handle(self)
    }

    /// Re-bind a parked handle, to the same connection or to a freshly
    /// acquired one when the original was torn down in the meantime.
    pub async fn reassociate(&self) -> Result<()> {
        self.pool.reassociate(self).await
    }

    /// Close the handle and return its connection to the pool.
    pub async fn close(self) -> Result<()> {
        let pool = self.pool.clone();
        pool.release(self).await
    }

    /// Register completion callbacks for the transaction this handle's
    /// connection is enlisted in. A no-op for wrapper variants that do not
    /// support synchronization.
    pub async fn add_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()> {
        let wrapper = self
            .wrapper()
            .ok_or_else(|| CorralError::IllegalHandleState("handle is closed".into()))?;
        let txn = wrapper.txn().lock().await;
        txn.add_synchronization(sync)
    }

    pub(crate) fn wrapper(&self) -> Option<Arc<ManagedConnection>> {
        match &*self.binding.lock() {
            HandleBinding::Bound(w) | HandleBinding::Parked(w) => Some(w.clone()),
            HandleBinding::Closed => None,
        }
    }

    /// Swap the binding to `Closed`, yielding the connection to release.
    /// Fails if the handle was already closed.
    pub(crate) fn take_for_close(&self) -> Result<Arc<ManagedConnection>> {
        let mut binding = self.binding.lock();
        match std::mem::replace(&mut *binding, HandleBinding::Closed) {
            HandleBinding::Bound(w) | HandleBinding::Parked(w) => Ok(w),
            HandleBinding::Closed => Err(CorralError::IllegalHandleState(
                "handle is already closed".into(),
            )),
        }
    }

    pub(crate) fn set_parked(&self) -> Result<()> {
        let mut binding = self.binding.lock();
        match std::mem::replace(&mut *binding, HandleBinding::Closed) {
            HandleBinding::Bound(w) | HandleBinding::Parked(w) => {
                *binding = HandleBinding::Parked(w);
                Ok(())
            }
            HandleBinding::Closed => Err(CorralError::IllegalHandleState(
                "cannot park a closed handle".into(),
            )),
        }
    }

    pub(crate) fn set_bound(&self, wrapper: Arc<ManagedConnection>) {
        *self.binding.lock() = HandleBinding::Bound(wrapper);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("request", &self.request)
            .field("identity", &self.identity)
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let binding = std::mem::replace(&mut *self.binding.lock(), HandleBinding::Closed);
        if let HandleBinding::Bound(w) | HandleBinding::Parked(w) = binding {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release_wrapper(w).await;
            });
        }
    }
}
