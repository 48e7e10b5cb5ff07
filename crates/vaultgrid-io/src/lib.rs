//! # vaultgrid-io: File Driver Abstraction for VaultGrid
//!
//! This crate provides a trait-based abstraction over the low-level file
//! primitives the replica engine needs from a resource's storage:
//!
//! - **`LocalDriver`** (default): `std::fs` operations for resources whose
//!   vault lives on the local host
//! - Other drivers (remote hosts, structured stores) implement the same
//!   [`FileDriver`] trait
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │      vaultgrid-core      │
//! │  (uses FileDriver trait) │
//! └────────────┬─────────────┘
//!              │
//! ┌────────────┴─────────────┐
//! │       vaultgrid-io       │
//! │  ┌─────────┐  ┌────────┐ │
//! │  │  Local  │  │ Remote │ │
//! │  │ Driver  │  │  host  │ │
//! │  └─────────┘  └────────┘ │
//! └──────────────────────────┘
//! ```

mod driver;
mod error;
mod local;

pub use driver::{FileDriver, FileHandle, FileStat, OpenFlags};
pub use error::IoError;
pub use local::LocalDriver;
