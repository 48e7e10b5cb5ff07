//! Replica catalog contract and resolver.
//!
//! The catalog is the system of record for replica rows. The engine only
//! needs the small [`Catalog`] surface below; [`MemoryCatalog`] implements it
//! in-process (with JSON snapshots) for single-node deployments and tests.
//!
//! [`resolve`] is the front half of every open: it queries the catalog,
//! drops superseded copies for readers, orders the list, and re-queues the
//! requested destination resource to the head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vaultgrid_types::{
    LogicalPath, ReplicaNumber, ReplicaRecord, ReplicaStatus, ResourceName, Timestamp,
};

use crate::GridError;
use crate::open::OpenIntent;
use crate::quota::{QuotaPair, QuotaUsage};
use crate::replica_list::{ReplicaList, Requeue};

// ============================================================================
// Contract
// ============================================================================

/// Errors reported by a catalog backend.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no replica {replica} of {path}")]
    ReplicaNotFound {
        path: LogicalPath,
        replica: ReplicaNumber,
    },

    #[error("replica {replica} of {path} already exists")]
    Conflict {
        path: LogicalPath,
        replica: ReplicaNumber,
    },

    #[error("catalog snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("catalog snapshot {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("catalog backend failure: {0}")]
    Backend(String),
}

/// Narrows a replica query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSelector {
    pub replica_number: Option<ReplicaNumber>,
}

/// Replica-row operations the engine needs from the catalog.
pub trait Catalog: Send + Sync {
    /// Every replica of `path` matching `selector`, in catalog order.
    /// An empty result means the object does not exist.
    fn find_replicas(
        &self,
        path: &LogicalPath,
        selector: &ReplicaSelector,
    ) -> Result<Vec<ReplicaRecord>, CatalogError>;

    /// Registers a new replica, optionally copied from `source`.
    fn register_replica(
        &self,
        new: &ReplicaRecord,
        source: Option<&ReplicaRecord>,
    ) -> Result<(), CatalogError>;

    /// Removes a replica row.
    fn unregister_replica(&self, record: &ReplicaRecord) -> Result<(), CatalogError>;

    /// Points an existing row at a new physical path.
    fn update_replica_path(&self, record: &ReplicaRecord, new_path: &Path)
    -> Result<(), CatalogError>;

    fn update_replica_size(&self, record: &ReplicaRecord, size: u64) -> Result<(), CatalogError>;

    fn update_replica_status(
        &self,
        record: &ReplicaRecord,
        status: ReplicaStatus,
    ) -> Result<(), CatalogError>;

    /// The row (if any) whose physical path on `resource` is exactly `path`.
    fn find_by_physical_path(
        &self,
        resource: &ResourceName,
        path: &Path,
    ) -> Result<Option<ReplicaRecord>, CatalogError>;

    /// Quota limits and usage charged to `user`.
    fn quota_usage(&self, user: &str) -> Result<QuotaUsage, CatalogError>;
}

// ============================================================================
// Resolver
// ============================================================================

/// Outcome of resolving a logical path for an open.
#[derive(Debug)]
pub enum Resolution {
    /// The catalog has no replica of the path.
    NotFound,
    Found {
        /// Ordered candidates; the head is preferred.
        replicas: ReplicaList,
        /// Where the requested destination ended up, if one was requested.
        destination: Option<Requeue>,
        /// Number to give the next replica of this object.
        next_replica: ReplicaNumber,
    },
}

/// Queries and orders the replicas of `path` for an open with `intent`.
///
/// Reads drop superseded copies (when a good copy remains) and sort cache
/// copies first. When `destination` names a resource or resource group, its
/// replica is moved to the head; [`Requeue::NoMatch`] signals that the
/// destination holds no copy.
pub fn resolve(
    catalog: &dyn Catalog,
    path: &LogicalPath,
    intent: OpenIntent,
    destination: Option<&ResourceName>,
) -> Result<Resolution, GridError> {
    let rows = catalog.find_replicas(path, &ReplicaSelector::default())?;
    if rows.is_empty() {
        debug!(path = %path, "no replicas in catalog");
        return Ok(Resolution::NotFound);
    }

    let mut replicas = ReplicaList::new(rows);
    let next_replica = replicas
        .max_replica_number()
        .map_or(ReplicaNumber::default(), ReplicaNumber::next);

    if intent == OpenIntent::Read {
        let (kept, dropped) = replicas.without_superseded();
        if !dropped.is_empty() {
            debug!(path = %path, dropped = dropped.len(), "dropped superseded replicas");
        }
        replicas = kept.sorted_for_read();
    }

    let destination = destination.map(|name| replicas.requeue_by_resource(name));

    Ok(Resolution::Found {
        replicas,
        destination,
        next_replica,
    })
}

// ============================================================================
// In-memory catalog
// ============================================================================

/// Quota limit row: a `None` resource is the user's global limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRow {
    pub user: String,
    #[serde(default)]
    pub resource: Option<ResourceName>,
    pub limit: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    #[serde(default)]
    replicas: Vec<ReplicaRecord>,
    #[serde(default)]
    quotas: Vec<QuotaRow>,
}

impl CatalogState {
    fn position(&self, record: &ReplicaRecord) -> Option<usize> {
        self.replicas.iter().position(|r| {
            r.logical_path == record.logical_path && r.replica_number == record.replica_number
        })
    }

    fn row_mut(&mut self, record: &ReplicaRecord) -> Result<&mut ReplicaRecord, CatalogError> {
        let idx = self
            .position(record)
            .ok_or_else(|| CatalogError::ReplicaNotFound {
                path: record.logical_path.clone(),
                replica: record.replica_number,
            })?;
        Ok(&mut self.replicas[idx])
    }
}

/// Catalog kept in process memory.
///
/// Quota usage is the total size of the replicas stored on each resource.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a catalog from a JSON snapshot written by [`Self::save_snapshot`].
    pub fn load_snapshot(path: &Path) -> Result<Self, CatalogError> {
        let data = std::fs::read(path).map_err(|source| CatalogError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
        let state: CatalogState =
            serde_json::from_slice(&data).map_err(|source| CatalogError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), replicas = state.replicas.len(), "loaded catalog snapshot");
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), CatalogError> {
        let data = serde_json::to_vec_pretty(&*self.lock()).map_err(|source| {
            CatalogError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, data).map_err(|source| CatalogError::Snapshot {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Inserts a row without any checks, for seeding.
    pub fn insert(&self, record: ReplicaRecord) {
        self.lock().replicas.push(record);
    }

    /// Sets the limit charged to `user` on `resource` (global when `None`).
    pub fn set_quota(&self, user: &str, resource: Option<ResourceName>, limit: i64) {
        let mut state = self.lock();
        state
            .quotas
            .retain(|q| !(q.user == user && q.resource == resource));
        state.quotas.push(QuotaRow {
            user: user.to_string(),
            resource,
            limit,
        });
    }

    /// Copy of every row.
    pub fn records(&self) -> Vec<ReplicaRecord> {
        self.lock().replicas.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for MemoryCatalog {
    fn find_replicas(
        &self,
        path: &LogicalPath,
        selector: &ReplicaSelector,
    ) -> Result<Vec<ReplicaRecord>, CatalogError> {
        Ok(self
            .lock()
            .replicas
            .iter()
            .filter(|r| &r.logical_path == path)
            .filter(|r| {
                selector
                    .replica_number
                    .is_none_or(|n| n == r.replica_number)
            })
            .cloned()
            .collect())
    }

    fn register_replica(
        &self,
        new: &ReplicaRecord,
        source: Option<&ReplicaRecord>,
    ) -> Result<(), CatalogError> {
        let mut state = self.lock();
        if state.position(new).is_some() {
            return Err(CatalogError::Conflict {
                path: new.logical_path.clone(),
                replica: new.replica_number,
            });
        }
        let mut row = new.clone();
        if let Some(source) = source {
            if row.checksum.is_none() {
                row.checksum.clone_from(&source.checksum);
            }
        }
        row.modified = Timestamp::now();
        debug!(
            path = %row.logical_path,
            replica = %row.replica_number,
            resource = %row.resource.name,
            "registered replica"
        );
        state.replicas.push(row);
        Ok(())
    }

    fn unregister_replica(&self, record: &ReplicaRecord) -> Result<(), CatalogError> {
        let mut state = self.lock();
        let idx = state
            .position(record)
            .ok_or_else(|| CatalogError::ReplicaNotFound {
                path: record.logical_path.clone(),
                replica: record.replica_number,
            })?;
        state.replicas.remove(idx);
        Ok(())
    }

    fn update_replica_path(
        &self,
        record: &ReplicaRecord,
        new_path: &Path,
    ) -> Result<(), CatalogError> {
        let mut state = self.lock();
        let row = state.row_mut(record)?;
        row.physical_path = new_path.to_path_buf();
        row.modified = Timestamp::now();
        Ok(())
    }

    fn update_replica_size(&self, record: &ReplicaRecord, size: u64) -> Result<(), CatalogError> {
        let mut state = self.lock();
        let row = state.row_mut(record)?;
        row.size = Some(size);
        row.modified = Timestamp::now();
        Ok(())
    }

    fn update_replica_status(
        &self,
        record: &ReplicaRecord,
        status: ReplicaStatus,
    ) -> Result<(), CatalogError> {
        let mut state = self.lock();
        let row = state.row_mut(record)?;
        row.status = status;
        row.modified = Timestamp::now();
        Ok(())
    }

    fn find_by_physical_path(
        &self,
        resource: &ResourceName,
        path: &Path,
    ) -> Result<Option<ReplicaRecord>, CatalogError> {
        Ok(self
            .lock()
            .replicas
            .iter()
            .find(|r| &r.resource.name == resource && r.physical_path == path)
            .cloned())
    }

    fn quota_usage(&self, user: &str) -> Result<QuotaUsage, CatalogError> {
        let state = self.lock();
        let mut used: HashMap<&ResourceName, i64> = HashMap::new();
        let mut total: i64 = 0;
        for replica in &state.replicas {
            let size = replica.size.unwrap_or(0) as i64;
            *used.entry(&replica.resource.name).or_default() += size;
            total = total.saturating_add(size);
        }

        let mut usage = QuotaUsage::default();
        for row in state.quotas.iter().filter(|q| q.user == user) {
            match &row.resource {
                Some(resource) => {
                    let overrun = used.get(resource).copied().unwrap_or(0);
                    usage.resources.insert(
                        resource.clone(),
                        QuotaPair {
                            limit: row.limit,
                            overrun,
                        },
                    );
                }
                None => usage.global.push(QuotaPair {
                    limit: row.limit,
                    overrun: total,
                }),
            }
        }
        Ok(usage)
    }
}
