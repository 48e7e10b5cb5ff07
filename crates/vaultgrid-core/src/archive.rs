//! Archive and bundle staging contract.
//!
//! Archive (compound) resources are never opened in place: data moves
//! between the archive and a cache resource of the same group. Bundle
//! resources hold whole collections inside one container which is extracted
//! into a cache directory before members can be read.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vaultgrid_types::{LogicalPath, ReplicaRecord, ResourceIdentity};

/// Errors from the archive/bundle driver.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("transfer {from} -> {to} failed: {source}")]
    Transfer {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("bundle not found: {path}")]
    BundleMissing { path: PathBuf },

    #[error("host {host} is not served by this driver")]
    UnknownHost { host: String },
}

/// A bundle-backed collection and the cache directory its members are
/// extracted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleCollection {
    pub collection: LogicalPath,
    /// Container holding the collection on the bundle resource.
    pub bundle_path: PathBuf,
    pub bundle_resource: ResourceIdentity,
    pub cache_resource: ResourceIdentity,
    pub cache_dir: PathBuf,
}

impl BundleCollection {
    /// Where member `name` lands after extraction.
    pub fn cached_member(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }
}

/// Data movement for archive and bundle resources.
pub trait ArchiveDriver: Send + Sync {
    /// Copies an archive-resident replica to `cache_path` on `cache`.
    /// Returns the number of bytes staged.
    fn stage_to_cache(
        &self,
        archive_copy: &ReplicaRecord,
        cache: &ResourceIdentity,
        cache_path: &Path,
    ) -> Result<u64, ArchiveError>;

    /// Copies a cache-resident replica to `archive_path` on `archive`.
    fn sync_to_archive(
        &self,
        cache_copy: &ReplicaRecord,
        archive: &ResourceIdentity,
        archive_path: &Path,
    ) -> Result<u64, ArchiveError>;

    /// Prepares the cache directory of a bundle collection.
    fn stage_cache_dir(&self, bundle: &BundleCollection) -> Result<(), ArchiveError>;

    /// Extracts the bundle's members into its cache directory.
    fn extract(&self, bundle: &BundleCollection) -> Result<(), ArchiveError>;
}

/// Driver for archives and bundles on the local host.
///
/// Archive copies are plain files. A bundle is a directory whose entries are
/// the collection's members.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    host: String,
}

impl LocalArchive {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn check_host(&self, resource: &ResourceIdentity) -> Result<(), ArchiveError> {
        if resource.host == self.host {
            Ok(())
        } else {
            Err(ArchiveError::UnknownHost {
                host: resource.host.clone(),
            })
        }
    }

    fn copy_file(from: &Path, to: &Path) -> Result<u64, ArchiveError> {
        let fail = |source| ArchiveError::Transfer {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        };
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        fs::copy(from, to).map_err(fail)
    }

    fn copy_tree(from: &Path, to: &Path) -> Result<(), ArchiveError> {
        let fail = |source| ArchiveError::Transfer {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        };
        fs::create_dir_all(to).map_err(fail)?;
        for entry in fs::read_dir(from).map_err(fail)? {
            let entry = entry.map_err(fail)?;
            let target = to.join(entry.file_name());
            if entry.file_type().map_err(fail)?.is_dir() {
                Self::copy_tree(&entry.path(), &target)?;
            } else if !target.exists() {
                Self::copy_file(&entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

impl ArchiveDriver for LocalArchive {
    fn stage_to_cache(
        &self,
        archive_copy: &ReplicaRecord,
        cache: &ResourceIdentity,
        cache_path: &Path,
    ) -> Result<u64, ArchiveError> {
        self.check_host(&archive_copy.resource)?;
        self.check_host(cache)?;
        let bytes = Self::copy_file(&archive_copy.physical_path, cache_path)?;
        info!(
            from = %archive_copy.physical_path.display(),
            to = %cache_path.display(),
            bytes,
            "staged archive copy to cache"
        );
        Ok(bytes)
    }

    fn sync_to_archive(
        &self,
        cache_copy: &ReplicaRecord,
        archive: &ResourceIdentity,
        archive_path: &Path,
    ) -> Result<u64, ArchiveError> {
        self.check_host(&cache_copy.resource)?;
        self.check_host(archive)?;
        let bytes = Self::copy_file(&cache_copy.physical_path, archive_path)?;
        info!(
            from = %cache_copy.physical_path.display(),
            to = %archive_path.display(),
            bytes,
            "synced cache copy to archive"
        );
        Ok(bytes)
    }

    fn stage_cache_dir(&self, bundle: &BundleCollection) -> Result<(), ArchiveError> {
        self.check_host(&bundle.cache_resource)?;
        fs::create_dir_all(&bundle.cache_dir).map_err(|source| ArchiveError::Transfer {
            from: bundle.bundle_path.clone(),
            to: bundle.cache_dir.clone(),
            source,
        })
    }

    fn extract(&self, bundle: &BundleCollection) -> Result<(), ArchiveError> {
        self.check_host(&bundle.bundle_resource)?;
        if !bundle.bundle_path.is_dir() {
            return Err(ArchiveError::BundleMissing {
                path: bundle.bundle_path.clone(),
            });
        }
        Self::copy_tree(&bundle.bundle_path, &bundle.cache_dir)?;
        debug!(
            collection = %bundle.collection,
            cache_dir = %bundle.cache_dir.display(),
            "extracted bundle"
        );
        Ok(())
    }
}
