//! Physical connection and factory capabilities

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// Scope under which a pooled connection may be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingScope {
    /// The connection may be shared with other work in the same transaction.
    Shareable,
    /// The connection is dedicated to one caller until released.
    Unshareable,
}

/// How a pooled connection participates in the caller's transaction.
///
/// The pool selects the matching transaction-wrapper strategy at acquire
/// time based on this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnlistmentPolicy {
    /// No enlistment and no synchronization registration.
    None,
    /// Participates in a local-only (non-XA) coordinator.
    Local,
    /// Bound to the platform-native transactional context.
    Platform,
    /// Enlists as a two-phase-commit branch with the external coordinator.
    GlobalXa,
    /// `GlobalXa` plus an out-of-band abort usable by a recovery component.
    AbortableXa,
}

/// Caller-supplied parameters for one connection request.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    sharing: SharingScope,
    enlistment: EnlistmentPolicy,
    properties: BTreeMap<String, String>,
}

impl ConnectionRequest {
    /// Create a request with the given sharing scope and enlistment policy.
    pub fn new(sharing: SharingScope, enlistment: EnlistmentPolicy) -> Self {
        Self {
            sharing,
            enlistment,
            properties: BTreeMap::new(),
        }
    }

    /// Set a driver-specific request property.
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Get the sharing scope.
    pub fn sharing(&self) -> SharingScope {
        self.sharing
    }

    /// Get the enlistment policy.
    pub fn enlistment(&self) -> EnlistmentPolicy {
        self.enlistment
    }

    /// Get the driver-specific request properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Signature of this request combined with the caller's identity.
    ///
    /// Pooled connections cache the signature they were created under; the
    /// free pool prefers an idle connection with an equal signature so the
    /// driver does not have to re-authenticate.
    pub fn signature(&self, identity: &Identity) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.sharing.hash(&mut hasher);
        self.enlistment.hash(&mut hasher);
        self.properties.hash(&mut hasher);
        identity.hash(&mut hasher);
        hasher.finish()
    }
}

/// Opaque security identity of the requesting caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    principal: String,
    realm: Option<String>,
}

impl Identity {
    /// Create an identity for the given principal.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            realm: None,
        }
    }

    /// Set the authentication realm.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Get the principal name.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Get the authentication realm, if any.
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }
}

/// A live connection to the backend resource manager.
///
/// The pool never interprets the connection; it only drives lifecycle
/// operations on it between callers.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Name of the backing resource, for diagnostics.
    fn resource_name(&self) -> &str;

    /// Reset caller-visible state so the connection can be reused by the
    /// next caller. A cleanup failure removes the connection from the pool.
    async fn cleanup(&self) -> Result<()>;

    /// Cheap liveness check consulted before an idle connection is reused.
    fn is_valid(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("resource_name", &self.resource_name())
            .finish()
    }
}

/// Factory capability the pool calls to open and close physical connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a new physical connection for the request and identity.
    async fn create(
        &self,
        request: &ConnectionRequest,
        identity: &Identity,
    ) -> Result<Arc<dyn PhysicalConnection>>;

    /// Close a physical connection permanently.
    ///
    /// Destroy is best-effort: the pool logs and swallows errors from it,
    /// and corrects its capacity accounting either way.
    async fn destroy(&self, connection: Arc<dyn PhysicalConnection>) -> Result<()>;
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    async fn create(
        &self,
        request: &ConnectionRequest,
        identity: &Identity,
    ) -> Result<Arc<dyn PhysicalConnection>> {
        (**self).create(request, identity).await
    }

    async fn destroy(&self, connection: Arc<dyn PhysicalConnection>) -> Result<()> {
        (**self).destroy(connection).await
    }
}
