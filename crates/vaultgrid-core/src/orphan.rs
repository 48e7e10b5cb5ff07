//! Orphan reconciliation.
//!
//! Before a new replica takes a physical path, whatever already sits there
//! is classified against the catalog:
//!
//! ```text
//!   nothing on disk                  -> Vacant
//!   file, no catalog row             -> orphan: <vault>/<orphan_dir>/<rel>.<rand>
//!   file, superseded or trash row    -> <vault>/<history_dir>/<rel>.<rand>, row updated
//!   file, current replica row        -> InUse, caller picks another path
//! ```
//!
//! The history move renames first and updates the catalog second; a failed
//! catalog update renames the file back before the error is reported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vaultgrid_io::IoError;
use vaultgrid_types::{ReplicaNumber, ReplicaRecord, ResourceIdentity};

use crate::GridError;
use crate::catalog::Catalog;
use crate::resource::DriverRegistry;
use crate::txn::UndoLog;
use crate::vault_path::VaultPathResolver;

/// Room kept free for the `.<random>` suffix of a relocated file.
const SUFFIX_RESERVE: usize = 17;

/// What was found at a candidate physical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing exists at the path.
    Vacant,
    /// An uncatalogued file was moved into the orphan directory.
    Relocated { to: PathBuf },
    /// A superseded or trashed replica was moved into the history directory
    /// and its catalog row now points there.
    HistoryMoved { replica: ReplicaRecord, to: PathBuf },
    /// A current replica owns the path.
    InUse { replica: ReplicaRecord },
}

impl ReconcileOutcome {
    /// Returns true if the candidate path can now be used.
    pub fn is_free(&self) -> bool {
        !matches!(self, Self::InUse { .. })
    }
}

/// Names of the directories (under each vault root) receiving displaced files.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    pub orphan_dir: String,
    pub history_dir: String,
    /// User that may never displace files.
    pub anonymous_user: String,
}

impl Default for VaultLayout {
    fn default() -> Self {
        Self {
            orphan_dir: "orphan".to_string(),
            history_dir: "replica".to_string(),
            anonymous_user: "anonymous".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct OrphanReconciler {
    catalog: Arc<dyn Catalog>,
    drivers: DriverRegistry,
    paths: VaultPathResolver,
    layout: VaultLayout,
}

impl std::fmt::Debug for OrphanReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanReconciler")
            .field("drivers", &self.drivers)
            .field("paths", &self.paths)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl OrphanReconciler {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        drivers: DriverRegistry,
        paths: VaultPathResolver,
        layout: VaultLayout,
    ) -> Self {
        Self {
            catalog,
            drivers,
            paths,
            layout,
        }
    }

    /// Classifies and, where needed, clears `physical` on `resource`.
    pub fn reconcile(
        &self,
        resource: &ResourceIdentity,
        physical: &Path,
        user: &str,
    ) -> Result<ReconcileOutcome, GridError> {
        let driver = self.drivers.for_resource(resource)?;
        match driver.stat(physical, &resource.host) {
            Err(IoError::NotFound { .. }) => return Ok(ReconcileOutcome::Vacant),
            Err(err) => return Err(err.into()),
            Ok(stat) if stat.is_dir => {
                return Err(GridError::PathIsNotAFile {
                    path: physical.to_path_buf(),
                });
            }
            Ok(_) => {}
        }

        if user == self.layout.anonymous_user {
            return Err(GridError::PermissionDenied {
                user: user.to_string(),
                action: "displace files in a vault",
            });
        }
        let rel = VaultPathResolver::vault_relative(resource, physical).ok_or_else(|| {
            GridError::PathNotInVault {
                path: physical.to_path_buf(),
                resource: resource.name.clone(),
            }
        })?;
        let len = physical.as_os_str().len() + SUFFIX_RESERVE;
        if len > self.paths.max_path_len() {
            return Err(GridError::PathTooLong {
                path: physical.to_path_buf(),
                len,
                max: self.paths.max_path_len(),
            });
        }

        let row = self
            .catalog
            .find_by_physical_path(&resource.name, physical)?;
        match row {
            None => {
                let to = Self::parked_path(resource, &self.layout.orphan_dir, rel);
                driver.rename(physical, &to, &resource.host)?;
                warn!(
                    resource = %resource.name,
                    from = %physical.display(),
                    to = %to.display(),
                    "relocated orphan file"
                );
                Ok(ReconcileOutcome::Relocated { to })
            }
            Some(replica)
                if replica.status.is_superseded()
                    || replica.logical_path.is_under(self.paths.trash_segment()) =>
            {
                let to = Self::parked_path(resource, &self.layout.history_dir, rel);
                driver.rename(physical, &to, &resource.host)?;

                let mut undo = UndoLog::new();
                undo.push("restore displaced replica", || {
                    driver
                        .rename(&to, physical, &resource.host)
                        .map_err(GridError::from)
                });
                if let Err(err) = self.catalog.update_replica_path(&replica, &to) {
                    return Err(undo.rollback(err.into()));
                }
                undo.commit();

                info!(
                    path = %replica.logical_path,
                    replica = %replica.replica_number,
                    to = %to.display(),
                    "moved superseded replica to history"
                );
                Ok(ReconcileOutcome::HistoryMoved { replica, to })
            }
            Some(replica) => Ok(ReconcileOutcome::InUse { replica }),
        }
    }

    /// Makes `candidate` usable for a new replica numbered `replica_number`.
    ///
    /// A path owned by a current replica is fatal for a caller-chosen path;
    /// otherwise `.<replica_number>` is appended and the result reconciled
    /// once more.
    pub fn claim(
        &self,
        resource: &ResourceIdentity,
        candidate: PathBuf,
        user: &str,
        replica_number: ReplicaNumber,
        explicit: bool,
    ) -> Result<PathBuf, GridError> {
        if self.reconcile(resource, &candidate, user)?.is_free() {
            return Ok(candidate);
        }
        if explicit {
            return Err(GridError::PathInUse { path: candidate });
        }

        let mut alternate = candidate;
        alternate
            .as_mut_os_string()
            .push(format!(".{replica_number}"));
        self.paths.check_len(&alternate)?;
        debug!(path = %alternate.display(), "path in use, trying replica-numbered path");

        if self.reconcile(resource, &alternate, user)?.is_free() {
            Ok(alternate)
        } else {
            Err(GridError::PathInUse { path: alternate })
        }
    }

    fn parked_path(resource: &ResourceIdentity, dir: &str, rel: &Path) -> PathBuf {
        let mut parked = resource.vault_path.join(dir).join(rel);
        let suffix: u32 = rand::random();
        parked.as_mut_os_string().push(format!(".{suffix}"));
        parked
    }
}
