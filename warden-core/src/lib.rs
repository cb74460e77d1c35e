//! Warden core: access authorization resolution for physical access points.
//!
//! Decides, for any (identity, access point) pair, whether passage is
//! permitted right now by reconciling direct grants, template-inherited
//! grants and zone defaults, under an emergency override layer that can
//! lock down part or all of a facility while keeping evacuation routes open.
//!
//! The crate is transport-agnostic; `warden-service` exposes it over a Unix
//! domain socket.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod audit;
pub mod bulk;
pub mod bus;
pub mod directory;
pub mod doors;
pub mod emergency;
pub mod errors;
pub mod grants;
pub mod ledger;
pub mod manager;
pub mod model;
pub mod resolver;
pub mod sqlite_ledger;

#[cfg(test)]
mod test_support;

pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, AuditRecord};
pub use bulk::{BulkCoordinator, BulkReport, BulkRequest, BulkStatus, ExpectedVersion};
pub use bus::{ChangeBatch, ChangeBus, Delta, Subscription};
pub use directory::{Directory, DirectorySnapshot, InMemoryDirectory};
pub use doors::{
    CommandOutcome, CommandPolicy, DoorCommandError, DoorController, DoorRecord,
    LoggingDoorController,
};
pub use emergency::{
    EmergencyController, EmergencyPhase, EmergencyScope, EmergencyState, EmergencyStatus,
};
pub use errors::{ErrorCategory, PairFailure, Result, WardenError};
pub use grants::{GrantFilter, GrantStore};
pub use ledger::{Ledger, MemoryLedger};
pub use manager::{AccessManager, ManagerOptions, ServiceStatus};
pub use sqlite_ledger::SqliteLedger;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
