//! Corral Core - Core abstractions for managed-connection pooling
//!
//! This crate provides the fundamental traits and types the corral pooling
//! crates depend on. It defines:
//!
//! - `PhysicalConnection` - Trait for the live resource-manager connection
//! - `ConnectionFactory` - Trait for the vendor driver that opens/closes them
//! - `TransactionCoordinator` - Trait for the external transaction coordinator
//! - Request/identity types (`ConnectionRequest`, `Identity`) and the
//!   `CorralError` error taxonomy

mod connection;
mod coordinator;
mod error;

pub use connection::*;
pub use coordinator::*;
pub use error::*;
