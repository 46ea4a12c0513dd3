//! Transaction enlistment strategies for pooled connections
//!
//! Each pooled connection carries exactly one transaction wrapper, selected
//! at acquire time from the request's `EnlistmentPolicy`. The wrapper decides
//! how the connection joins and leaves the caller's transaction, from "never
//! enlists" through a full two-phase-commit branch with an out-of-band abort.

mod wrapper;


pub use wrapper::{EnlistmentState, TransactionWrapper};
