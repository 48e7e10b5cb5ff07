//! Engine error types.
//!
//! Every failure the engine can report maps to a stable negative status via
//! [`GridError::code`], which is what the request dispatcher hands back to
//! clients.

use std::path::PathBuf;

use vaultgrid_io::IoError;
use vaultgrid_types::{LogicalPath, ResourceClass, ResourceName, TypeError};

use crate::archive::ArchiveError;
use crate::catalog::CatalogError;
use crate::policy::PolicyError;
use crate::zone::RemoteError;

/// Errors from the replica engine.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    // ------------------------------------------------------------------
    // User input
    // ------------------------------------------------------------------
    /// A create named no resource and the policy supplied no default.
    #[error("no resource specified for create of {path}")]
    NoResourceForCreate { path: LogicalPath },

    #[error("invalid path: {source}")]
    InvalidPath {
        #[from]
        source: TypeError,
    },

    /// Derived physical path is longer than the configured maximum.
    #[error("physical path of {len} bytes exceeds the {max} byte limit: {path}")]
    PathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("physical path is a directory: {path}")]
    PathIsNotAFile { path: PathBuf },

    #[error("physical path {path} is outside the vault of {resource}")]
    PathNotInVault { path: PathBuf, resource: ResourceName },

    #[error("user {user} may not {action}")]
    PermissionDenied { user: String, action: &'static str },

    /// A caller-chosen physical path belongs to a current replica.
    #[error("physical path {path} is in use by a current replica")]
    PathInUse { path: PathBuf },

    // ------------------------------------------------------------------
    // Object lookup
    // ------------------------------------------------------------------
    #[error("no data object at {path}")]
    ObjectNotFound { path: LogicalPath },

    #[error("no replica of {path} on {resource}")]
    NoMatchingReplica {
        path: LogicalPath,
        resource: ResourceName,
    },

    // ------------------------------------------------------------------
    // Resource state
    // ------------------------------------------------------------------
    #[error("unknown resource or resource group: {name}")]
    ResourceNotFound { name: ResourceName },

    #[error("resource {name} of class {class} cannot serve {operation}")]
    ResourceTypeUnsupported {
        name: ResourceName,
        class: ResourceClass,
        operation: &'static str,
    },

    #[error("resource group {group} has no usable {wanted} member")]
    NoUsableGroupMember {
        group: ResourceName,
        wanted: &'static str,
    },

    // ------------------------------------------------------------------
    // Descriptor tables
    // ------------------------------------------------------------------
    #[error("{table} descriptor table exhausted ({capacity} slots)")]
    OutOfDescriptors {
        table: &'static str,
        capacity: usize,
    },

    #[error("bad {table} descriptor: {index}")]
    BadDescriptor { table: &'static str, index: i64 },

    // ------------------------------------------------------------------
    // Quota
    // ------------------------------------------------------------------
    #[error("quota exceeded: no candidate resource can take {requested} more bytes")]
    QuotaExceeded { requested: u64 },

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("file driver error: {0}")]
    Io(#[from] IoError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("archive driver error: {0}")]
    Archive(#[from] ArchiveError),

    /// Failure reported by a remote zone; its status is passed through.
    #[error("remote zone error: {0}")]
    Remote(#[from] RemoteError),

    /// A compensating action failed after `cause`.
    #[error("{cause}; rollback failed: {rollback}")]
    RollbackFailed {
        cause: Box<GridError>,
        rollback: Box<GridError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// Negative status code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidPath { .. } => -310_000,
            Self::NoResourceForCreate { .. } => -311_000,
            Self::PathTooLong { .. } => -312_000,
            Self::PathIsNotAFile { .. } => -313_000,
            Self::PathNotInVault { .. } => -314_000,
            Self::PermissionDenied { .. } => -315_000,
            Self::PathInUse { .. } => -316_000,
            Self::ObjectNotFound { .. } => -320_000,
            Self::NoMatchingReplica { .. } => -321_000,
            Self::ResourceNotFound { .. } => -330_000,
            Self::ResourceTypeUnsupported { .. } => -331_000,
            Self::NoUsableGroupMember { .. } => -332_000,
            Self::OutOfDescriptors { .. } => -340_000,
            Self::BadDescriptor { .. } => -341_000,
            Self::QuotaExceeded { .. } => -350_000,
            Self::Catalog(_) => -360_000,
            Self::Io(_) => -361_000,
            Self::Policy(_) => -362_000,
            Self::Archive(_) => -363_000,
            Self::RollbackFailed { .. } => -370_000,
            Self::Remote(err) => err.status(),
            Self::Internal(_) => -399_000,
        }
    }

    /// Returns true for resource-state failures that another member of the
    /// same resource group might not share.
    pub fn is_resource_state(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ResourceTypeUnsupported { .. }
                | Self::PathInUse { .. }
                | Self::PathTooLong { .. }
        )
    }
}
