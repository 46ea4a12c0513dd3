//! Managed-connection pooling
//!
//! This module provides the pool manager, free-list bookkeeping, and pool
//! statistics.
//!
//! # Example
//!
//! ```ignore
//! use corral_pool::{PoolConfig, PoolManager};
//! use corral_core::{ConnectionRequest, EnlistmentPolicy, Identity, SharingScope};
//!
//! let config = PoolConfig::new(1, 10).with_acquire_timeout_ms(5000);
//! let pool = PoolManager::new(config, factory, coordinator);
//!
//! let request = ConnectionRequest::new(SharingScope::Shareable, EnlistmentPolicy::GlobalXa);
//! let handle = pool.acquire(request, Identity::new("app")).await?;
//! // Use the connection...
//! handle.close().await?;
//! ```

mod free_pool;
mod manager;
mod stats;

#[cfg(test)]
mod tests;

pub use manager::PoolManager;
pub use stats::PoolStats;
