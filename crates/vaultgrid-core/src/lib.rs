//! # vaultgrid-core: Replica resolution and open-descriptor engine
//!
//! Given a logical object path and an open intent, the engine decides which
//! physical copy to use, stages it when it lives behind an archive or bundle
//! resource, allocates a connection-local descriptor tying the open to its
//! replicas, and keeps the vault tree consistent with the catalog.
//!
//! ## Control flow
//!
//! ```text
//! open request
//!     │
//!     ▼
//! ┌──────────────┐   ┌───────────────────────────────────────────┐
//! │   catalog    │──▶│             open state machine            │
//! │   resolver   │   │  quota gate · vault paths · orphan check  │
//! └──────────────┘   └─────────────────────┬─────────────────────┘
//!                                          ▼
//!                             ┌────────────────────────┐
//!                             │   descriptor tables    │──▶ file driver
//!                             └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]: Catalog contract, the replica resolver and [`MemoryCatalog`]
//! - [`open`]: The open state machine ([`OpenEngine`]) and per-connection [`Session`]
//! - [`descriptor`]: Generation-checked logical and physical descriptor tables
//! - [`vault_path`]: Graft and random physical path derivation
//! - [`orphan`]: Orphan and superseded-file reconciliation
//! - [`quota`]: Connection-scoped quota gate
//!
//! Collaborators the engine does not own (catalog, policy, archive driver,
//! zone routing) are traits with in-process implementations for single-node
//! use.

pub mod archive;
pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod open;
pub mod orphan;
pub mod policy;
pub mod quota;
pub mod replica_list;
pub mod resource;
pub mod txn;
pub mod vault_path;
pub mod zone;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use archive::{ArchiveDriver, ArchiveError, BundleCollection, LocalArchive};
pub use catalog::{Catalog, CatalogError, MemoryCatalog, ReplicaSelector, Resolution};
pub use descriptor::{DescriptorTables, LogicalHandle, PhysicalHandle, RESERVED_SLOTS};
pub use error::GridError;
pub use open::{
    ChecksumMode, EngineSettings, OpenEngine, OpenIntent, OpenOutcome, OpenRequest,
    PhysicalOpenPolicy, Session,
};
pub use orphan::{OrphanReconciler, ReconcileOutcome, VaultLayout};
pub use policy::{PolicyHooks, QuotaPolicy, StaticPolicy, VaultPathPolicy};
pub use quota::{QuotaCache, QuotaPair, QuotaUsage};
pub use replica_list::{ReplicaList, Requeue};
pub use resource::{DriverRegistry, ResourceTable};
pub use txn::UndoLog;
pub use vault_path::VaultPathResolver;
pub use zone::{LocalZone, RemoteError, RemoteOpenResult, ZoneRouter};
