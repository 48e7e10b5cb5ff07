//! Replica open state machine.
//!
//! ```text
//!   open(request)
//!     |
//!     +-- remote zone? ------------------------> allocate_remote
//!     |
//!     +-- allocate logical slot
//!     +-- resolve replicas -- none --> create? -> new replica on destination
//!     +-- preprocess hook, destination re-queue
//!     |
//!     |   read:  normal/cache  open head
//!     |          archive       stage to group cache, archive copy -> others
//!     |          bundle        extract collection to cache dir
//!     |   write: has copy      open it (archive head: cache copy + sync on close)
//!     |          no copy       quota gate -> empty replica on first usable member
//!     |                        (compound: cache replica + sync target)
//!     |
//!     +-- fill slot -> physical open (always / never / by size)
//! ```
//!
//! A failing open frees its slot (closing any file it opened) and undoes
//! every catalog and filesystem step it took, newest first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vaultgrid_io::{FileDriver, FileHandle, IoError, OpenFlags};
use vaultgrid_types::{
    LogicalPath, ReplicaNumber, ReplicaRecord, ReplicaStatus, ResourceClass, ResourceIdentity,
    ResourceName,
};

use crate::GridError;
use crate::archive::{ArchiveDriver, BundleCollection};
use crate::catalog::{self, Catalog, Resolution};
use crate::descriptor::{
    DescriptorFill, DescriptorTables, LogicalHandle, PhysicalDescriptor, PhysicalHandle,
    PhysicalLink, Released, SyncTarget,
};
use crate::orphan::{OrphanReconciler, VaultLayout};
use crate::policy::{OpenContext, PolicyHooks};
use crate::quota::QuotaCache;
use crate::replica_list::{ReplicaList, Requeue};
use crate::resource::{DriverRegistry, ResourceTable};
use crate::txn::UndoLog;
use crate::vault_path::VaultPathResolver;
use crate::zone::{LocalZone, ZoneRouter};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenIntent {
    #[default]
    Read,
    Write,
}

/// When the chosen replica's file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysicalOpenPolicy {
    #[default]
    Always,
    /// Metadata-only open.
    Never,
    /// Skip the open when the payload fits in one transfer buffer.
    BySize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    None,
    /// Record this checksum on the new replica.
    Register(String),
    /// Verify the data against this checksum.
    Verify(String),
}

/// A client open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub path: LogicalPath,
    pub intent: OpenIntent,
    /// Create the object if it does not exist (writes only).
    pub create: bool,
    pub truncate: bool,
    /// Resource or resource group to open on.
    pub destination: Option<ResourceName>,
    /// Caller-chosen physical path for a new replica.
    pub physical_path: Option<PathBuf>,
    pub data_size: Option<u64>,
    /// The payload travels with the request.
    pub data_included: bool,
    pub physical_open: PhysicalOpenPolicy,
    pub checksum: ChecksumMode,
    pub purge_cache: bool,
}

impl OpenRequest {
    fn new(path: LogicalPath, intent: OpenIntent) -> Self {
        Self {
            path,
            intent,
            create: false,
            truncate: false,
            destination: None,
            physical_path: None,
            data_size: None,
            data_included: false,
            physical_open: PhysicalOpenPolicy::default(),
            checksum: ChecksumMode::default(),
            purge_cache: false,
        }
    }

    pub fn read(path: LogicalPath) -> Self {
        Self::new(path, OpenIntent::Read)
    }

    pub fn write(path: LogicalPath) -> Self {
        Self::new(path, OpenIntent::Write)
    }

    /// Write, creating the object if it does not exist.
    pub fn create(path: LogicalPath) -> Self {
        Self {
            create: true,
            ..Self::write(path)
        }
    }

    pub fn on_resource(mut self, resource: impl Into<ResourceName>) -> Self {
        self.destination = Some(resource.into());
        self
    }

    pub fn at_physical_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.physical_path = Some(path.into());
        self
    }

    pub fn with_data_size(mut self, size: u64) -> Self {
        self.data_size = Some(size);
        self
    }

    pub fn with_data_included(mut self) -> Self {
        self.data_included = true;
        self
    }

    pub fn with_physical_open(mut self, policy: PhysicalOpenPolicy) -> Self {
        self.physical_open = policy;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumMode) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn purging_cache(mut self) -> Self {
        self.purge_cache = true;
        self
    }
}

/// Result of a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub handle: LogicalHandle,
    /// False for metadata-only opens.
    pub physically_opened: bool,
}

impl OpenOutcome {
    pub fn index(&self) -> i32 {
        self.handle.index()
    }
}

// ============================================================================
// Engine and session
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Local zone name.
    pub zone: String,
    /// Payloads up to this size skip the physical open under `BySize`.
    pub single_buffer_bytes: u64,
    pub max_path_len: usize,
    pub trash_segment: String,
    pub layout: VaultLayout,
    /// Logical table size, reserved slots included.
    pub logical_capacity: usize,
    pub physical_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            zone: "tempZone".to_string(),
            single_buffer_bytes: 32 * 1024 * 1024,
            max_path_len: 1088,
            trash_segment: "trash".to_string(),
            layout: VaultLayout::default(),
            logical_capacity: 1026,
            physical_capacity: 1026,
        }
    }
}

/// Per-connection state: the user, the descriptor tables and the quota
/// cache.
#[derive(Debug)]
pub struct Session {
    user: String,
    descriptors: DescriptorTables,
    quota: QuotaCache,
}

impl Session {
    pub fn new(user: impl Into<String>, logical_capacity: usize, physical_capacity: usize) -> Self {
        Self {
            user: user.into(),
            descriptors: DescriptorTables::new(logical_capacity, physical_capacity),
            quota: QuotaCache::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn descriptors(&self) -> &DescriptorTables {
        &self.descriptors
    }

    pub fn quota(&self) -> &QuotaCache {
        &self.quota
    }

    /// Turns a client-supplied descriptor index back into a handle.
    pub fn resolve(&self, index: i32) -> Result<LogicalHandle, GridError> {
        self.descriptors.resolve(index)
    }
}

/// Chosen replicas for one open, before they move into the descriptor.
#[derive(Debug)]
struct Selection {
    primary: ReplicaRecord,
    others: Vec<ReplicaRecord>,
    sync_target: Option<SyncTarget>,
    /// File created for a new replica, still open.
    created: Option<FileHandle>,
}

impl Selection {
    fn existing(primary: ReplicaRecord, others: Vec<ReplicaRecord>) -> Self {
        Self {
            primary,
            others,
            sync_target: None,
            created: None,
        }
    }
}

/// The replica resolution and open engine.
pub struct OpenEngine {
    settings: EngineSettings,
    resources: ResourceTable,
    catalog: Arc<dyn Catalog>,
    policy: Arc<dyn PolicyHooks>,
    drivers: DriverRegistry,
    archive: Arc<dyn ArchiveDriver>,
    zones: Arc<dyn ZoneRouter>,
    paths: VaultPathResolver,
    orphans: OrphanReconciler,
}

impl std::fmt::Debug for OpenEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenEngine")
            .field("settings", &self.settings)
            .field("resources", &self.resources)
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

impl OpenEngine {
    pub fn new(
        settings: EngineSettings,
        resources: ResourceTable,
        catalog: Arc<dyn Catalog>,
        policy: Arc<dyn PolicyHooks>,
        drivers: DriverRegistry,
        archive: Arc<dyn ArchiveDriver>,
    ) -> Self {
        let paths = VaultPathResolver::new(settings.max_path_len, settings.trash_segment.clone());
        let orphans = OrphanReconciler::new(
            Arc::clone(&catalog),
            drivers.clone(),
            paths.clone(),
            settings.layout.clone(),
        );
        Self {
            settings,
            resources,
            catalog,
            policy,
            drivers,
            archive,
            zones: Arc::new(LocalZone),
            paths,
            orphans,
        }
    }

    pub fn with_zone_router(mut self, zones: Arc<dyn ZoneRouter>) -> Self {
        self.zones = zones;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn orphans(&self) -> &OrphanReconciler {
        &self.orphans
    }

    /// Starts a connection for `user` with empty descriptor tables.
    pub fn session(&self, user: impl Into<String>) -> Session {
        Session::new(
            user,
            self.settings.logical_capacity,
            self.settings.physical_capacity,
        )
    }

    // ------------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------------

    /// Opens `request.path` and returns the descriptor tying the open to its
    /// replicas.
    pub fn open(
        &self,
        session: &mut Session,
        request: OpenRequest,
    ) -> Result<OpenOutcome, GridError> {
        if !self.zones.is_local(&request.path) {
            return self.open_remote(session, request);
        }

        let handle = session.descriptors.allocate()?;
        let path = request.path.clone();
        let mut undo = UndoLog::new();
        match self.open_local(session, handle, request, &mut undo) {
            Ok(physically_opened) => {
                undo.commit();
                info!(
                    user = %session.user,
                    path = %path,
                    descriptor = handle.index(),
                    physically_opened,
                    "opened data object"
                );
                Ok(OpenOutcome {
                    handle,
                    physically_opened,
                })
            }
            Err(err) => {
                if let Ok(released) = session.descriptors.free(handle) {
                    self.close_released_file(released);
                }
                warn!(user = %session.user, path = %path, error = %err, "open failed");
                Err(undo.rollback(err))
            }
        }
    }

    fn open_remote(
        &self,
        session: &mut Session,
        request: OpenRequest,
    ) -> Result<OpenOutcome, GridError> {
        let host = self.zones.host_for(&request.path)?;
        let result = self.zones.open_remote(&host, &request)?;
        let remote_index = result.remote_index;
        let physically_opened = result.physical_index.is_some();

        match session
            .descriptors
            .allocate_remote(request, host.clone(), result)
        {
            Ok(handle) => {
                debug!(
                    host = %host,
                    remote_index,
                    descriptor = handle.index(),
                    "opened on remote zone"
                );
                Ok(OpenOutcome {
                    handle,
                    physically_opened,
                })
            }
            Err(err) => {
                if let Err(close_err) = self.zones.close_remote(&host, remote_index) {
                    warn!(
                        host = %host,
                        remote_index,
                        error = %close_err,
                        "remote close after failed open"
                    );
                }
                Err(err)
            }
        }
    }

    fn open_local<'s>(
        &'s self,
        session: &mut Session,
        handle: LogicalHandle,
        request: OpenRequest,
        undo: &mut UndoLog<'s>,
    ) -> Result<bool, GridError> {
        let destination = match request.intent {
            OpenIntent::Write => request
                .destination
                .clone()
                .or_else(|| self.policy.default_resource(&request.path)),
            OpenIntent::Read => request.destination.clone(),
        };

        let resolution = catalog::resolve(
            &*self.catalog,
            &request.path,
            request.intent,
            destination.as_ref(),
        )?;
        let selection = match resolution {
            Resolution::NotFound => {
                if !(request.create && request.intent == OpenIntent::Write) {
                    return Err(GridError::ObjectNotFound {
                        path: request.path.clone(),
                    });
                }
                let destination = destination.ok_or_else(|| GridError::NoResourceForCreate {
                    path: request.path.clone(),
                })?;
                debug!(path = %request.path, resource = %destination, "creating data object");
                self.new_replica(
                    session,
                    &request,
                    &destination,
                    ReplicaNumber::default(),
                    None,
                    Vec::new(),
                    undo,
                )?
            }
            Resolution::Found {
                mut replicas,
                destination: mut requeue,
                next_replica,
            } => {
                let mut ctx = OpenContext {
                    user: &session.user,
                    path: &request.path,
                    intent: request.intent,
                    replicas: &mut replicas,
                };
                self.policy.preprocess_open(&mut ctx)?;
                if replicas.is_empty() {
                    return Err(GridError::ObjectNotFound {
                        path: request.path.clone(),
                    });
                }
                // The hook may have reordered the list
                if let Some(name) = &destination {
                    requeue = Some(replicas.requeue_by_resource(name));
                }

                match request.intent {
                    OpenIntent::Read => self.select_for_read(
                        session,
                        &request,
                        replicas,
                        requeue,
                        destination.as_ref(),
                        next_replica,
                        undo,
                    )?,
                    OpenIntent::Write => self.select_for_write(
                        session,
                        &request,
                        replicas,
                        requeue,
                        destination.as_ref(),
                        next_replica,
                        undo,
                    )?,
                }
            }
        };

        let size = match request.intent {
            OpenIntent::Read => request.data_size.or(selection.primary.size),
            OpenIntent::Write => request.data_size,
        };
        let open_now = self.should_open(&request, size);
        let intent = request.intent;
        let truncate = request.truncate && selection.created.is_none();
        let primary = selection.primary.clone();
        let created = selection.created;

        session.descriptors.fill(
            handle,
            DescriptorFill {
                request,
                primary: selection.primary,
                others: selection.others,
                sync_target: selection.sync_target,
            },
        )?;

        if !open_now {
            if let Some(file) = created {
                self.drivers.for_resource(&primary.resource)?.close(file)?;
            }
            debug!(path = %primary.logical_path, "metadata-only open");
            return Ok(false);
        }

        let driver = self.drivers.for_resource(&primary.resource)?;
        let file = match created {
            Some(file) => file,
            None => {
                let flags = match intent {
                    OpenIntent::Read => OpenFlags::read_only(),
                    OpenIntent::Write => OpenFlags::read_write(),
                };
                driver.open(&primary.physical_path, flags, &primary.resource.host)?
            }
        };
        let linked = session.descriptors.open_physical(
            handle,
            PhysicalDescriptor {
                class: primary.class(),
                category: primary.resource.category,
                physical_path: primary.physical_path.clone(),
                host: primary.resource.host.clone(),
                file: Some(file),
            },
        )?;

        if truncate {
            self.truncate_linked(session, handle, linked, &primary, undo)?;
        }
        Ok(true)
    }

    /// Empties a replica that is already linked to a physical slot.
    ///
    /// The catalog size is reset before the file is cut, and restored if the
    /// cut fails.
    fn truncate_linked<'s>(
        &'s self,
        session: &mut Session,
        handle: LogicalHandle,
        linked: PhysicalHandle,
        primary: &ReplicaRecord,
        undo: &mut UndoLog<'s>,
    ) -> Result<(), GridError> {
        self.catalog.update_replica_size(primary, 0)?;
        if let Some(old_size) = primary.size {
            let catalog = &*self.catalog;
            let row = primary.clone();
            undo.push("restore replica size", move || {
                catalog
                    .update_replica_size(&row, old_size)
                    .map_err(GridError::from)
            });
        }

        let driver = self.drivers.for_resource(&primary.resource)?;
        let file = session
            .descriptors
            .physical_mut(linked)?
            .file
            .as_mut()
            .ok_or_else(|| GridError::Internal(format!("descriptor {handle} has no open file")))?;
        driver.truncate(file, 0)?;
        session.descriptors.get_mut(handle)?.set_data_size(0);
        debug!(path = %primary.logical_path, "truncated replica");
        Ok(())
    }

    fn should_open(&self, request: &OpenRequest, size: Option<u64>) -> bool {
        match request.physical_open {
            PhysicalOpenPolicy::Always => true,
            PhysicalOpenPolicy::Never => false,
            PhysicalOpenPolicy::BySize => {
                let fits = size.is_some_and(|size| size <= self.settings.single_buffer_bytes);
                !(request.data_included || fits)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Read selection
    // ------------------------------------------------------------------------

    fn select_for_read<'s>(
        &'s self,
        session: &Session,
        request: &OpenRequest,
        mut replicas: ReplicaList,
        requeue: Option<Requeue>,
        destination: Option<&ResourceName>,
        next_replica: ReplicaNumber,
        undo: &mut UndoLog<'s>,
    ) -> Result<Selection, GridError> {
        if let (Some(Requeue::NoMatch), Some(resource)) = (requeue, destination) {
            return Err(GridError::NoMatchingReplica {
                path: request.path.clone(),
                resource: resource.clone(),
            });
        }
        let head = replicas
            .take_head()
            .ok_or_else(|| GridError::ObjectNotFound {
                path: request.path.clone(),
            })?;

        match head.class() {
            ResourceClass::Normal | ResourceClass::Cache => {
                let others = replicas.take_where(|r| r.resource.same_group(&head.resource));
                Ok(Selection::existing(head, others))
            }
            ResourceClass::Archive => {
                let mut cached = replicas.take_where(|r| {
                    r.class() == ResourceClass::Cache && r.resource.same_group(&head.resource)
                });
                let primary = if cached.is_empty() {
                    self.stage_archive(session, &head, next_replica, undo)?
                } else {
                    debug!(path = %head.logical_path, "reusing staged cache copy");
                    cached.remove(0)
                };
                let mut others = vec![head];
                others.extend(cached);
                others.extend(replicas.take_where(|r| r.resource.same_group(&primary.resource)));
                Ok(Selection::existing(primary, others))
            }
            ResourceClass::Bundle => {
                let cached = self.stage_bundle(request, &head)?;
                Ok(Selection::existing(cached, vec![head]))
            }
        }
    }

    /// Copies an archive replica onto its group's cache resource and
    /// registers the copy.
    fn stage_archive<'s>(
        &'s self,
        session: &Session,
        archive_copy: &ReplicaRecord,
        number: ReplicaNumber,
        undo: &mut UndoLog<'s>,
    ) -> Result<ReplicaRecord, GridError> {
        let cache = self.resources.cache_for(&archive_copy.resource)?;
        let driver = self.drivers.for_resource(&cache)?;
        let policy = self.policy.vault_path_policy(&cache)?;
        let candidate =
            self.paths
                .resolve(&policy, &cache, &archive_copy.logical_path, &session.user)?;
        let cache_path = self
            .orphans
            .claim(&cache, candidate, &session.user, number, false)?;

        let bytes = self
            .archive
            .stage_to_cache(archive_copy, &cache, &cache_path)?;
        {
            let path = cache_path.clone();
            let host = cache.host.clone();
            undo.push("remove staged cache copy", move || {
                driver.unlink(&path, &host).map_err(GridError::from)
            });
        }

        let mut staged = ReplicaRecord::new(
            archive_copy.logical_path.clone(),
            number,
            cache,
            cache_path,
        )
        .with_size(bytes);
        staged.checksum.clone_from(&archive_copy.checksum);
        self.catalog.register_replica(&staged, Some(archive_copy))?;
        {
            let catalog = &*self.catalog;
            let row = staged.clone();
            undo.push("unregister staged cache copy", move || {
                catalog.unregister_replica(&row).map_err(GridError::from)
            });
        }

        info!(
            path = %staged.logical_path,
            archive = %archive_copy.resource.name,
            cache = %staged.resource.name,
            bytes,
            "staged archive replica"
        );
        Ok(staged)
    }

    /// Makes a bundle member readable from its cache directory, extracting
    /// the bundle only if the member is not there yet.
    fn stage_bundle(
        &self,
        request: &OpenRequest,
        bundle_copy: &ReplicaRecord,
    ) -> Result<ReplicaRecord, GridError> {
        let cache = self.resources.cache_for(&bundle_copy.resource)?;
        let collection = request
            .path
            .parent()
            .ok_or_else(|| GridError::ObjectNotFound {
                path: request.path.clone(),
            })?;
        let bundle_path = bundle_copy
            .physical_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| GridError::PathNotInVault {
                path: bundle_copy.physical_path.clone(),
                resource: bundle_copy.resource.name.clone(),
            })?;
        let policy = self.policy.vault_path_policy(&cache)?;
        let cache_dir = self
            .paths
            .graft(&cache.vault_path, &collection, None, policy.trim_count);
        let bundle = BundleCollection {
            collection,
            bundle_path,
            bundle_resource: bundle_copy.resource.clone(),
            cache_resource: cache.clone(),
            cache_dir,
        };
        let member = bundle.cached_member(request.path.file_name());
        self.paths.check_len(&member)?;

        let driver = self.drivers.for_resource(&cache)?;
        let stat = match driver.stat(&member, &cache.host) {
            Ok(stat) => stat,
            Err(IoError::NotFound { .. }) => {
                self.archive.stage_cache_dir(&bundle)?;
                self.archive.extract(&bundle)?;
                info!(
                    collection = %bundle.collection,
                    cache_dir = %bundle.cache_dir.display(),
                    "extracted bundle to cache"
                );
                driver.stat(&member, &cache.host)?
            }
            Err(err) => return Err(err.into()),
        };

        Ok(ReplicaRecord::new(
            request.path.clone(),
            bundle_copy.replica_number,
            cache,
            member,
        )
        .with_size(stat.size))
    }

    // ------------------------------------------------------------------------
    // Write selection
    // ------------------------------------------------------------------------

    fn select_for_write<'s>(
        &'s self,
        session: &mut Session,
        request: &OpenRequest,
        mut replicas: ReplicaList,
        requeue: Option<Requeue>,
        destination: Option<&ResourceName>,
        next_replica: ReplicaNumber,
        undo: &mut UndoLog<'s>,
    ) -> Result<Selection, GridError> {
        if let (Some(Requeue::NoMatch), Some(resource)) = (requeue, destination) {
            let source = replicas.head().cloned();
            return self.new_replica(
                session,
                request,
                resource,
                next_replica,
                source.as_ref(),
                replicas.into_vec(),
                undo,
            );
        }

        let head = replicas
            .take_head()
            .ok_or_else(|| GridError::ObjectNotFound {
                path: request.path.clone(),
            })?;
        match head.class() {
            ResourceClass::Normal => Ok(Selection::existing(head, replicas.into_vec())),
            ResourceClass::Cache => {
                let sync_target = self.sync_target_for(session, &head, &replicas, next_replica)?;
                Ok(Selection {
                    sync_target,
                    ..Selection::existing(head, replicas.into_vec())
                })
            }
            ResourceClass::Archive => {
                let mut cached = replicas.take_where(|r| {
                    r.class() == ResourceClass::Cache && r.resource.same_group(&head.resource)
                });
                let primary = if cached.is_empty() {
                    self.stage_archive(session, &head, next_replica, undo)?
                } else {
                    cached.remove(0)
                };
                let sync_target = SyncTarget {
                    record: head.clone(),
                    registered: true,
                };
                let mut others = vec![head];
                others.extend(cached);
                others.extend(replicas);
                Ok(Selection {
                    sync_target: Some(sync_target),
                    ..Selection::existing(primary, others)
                })
            }
            ResourceClass::Bundle => Err(GridError::ResourceTypeUnsupported {
                name: head.resource.name.clone(),
                class: head.class(),
                operation: "write",
            }),
        }
    }

    /// Archive replica a written cache copy must be pushed to on close.
    fn sync_target_for(
        &self,
        session: &Session,
        cache_copy: &ReplicaRecord,
        replicas: &ReplicaList,
        next_replica: ReplicaNumber,
    ) -> Result<Option<SyncTarget>, GridError> {
        if cache_copy.resource.group.is_none() {
            return Ok(None);
        }
        let Ok(archive) = self.resources.archive_for(&cache_copy.resource) else {
            return Ok(None);
        };
        if let Some(existing) = replicas.find(|r| r.resource.name == archive.name) {
            return Ok(Some(SyncTarget {
                record: existing.clone(),
                registered: true,
            }));
        }
        let record = self.archive_record(session, &cache_copy.logical_path, archive, next_replica)?;
        Ok(Some(SyncTarget {
            record,
            registered: false,
        }))
    }

    fn archive_record(
        &self,
        session: &Session,
        path: &LogicalPath,
        archive: ResourceIdentity,
        number: ReplicaNumber,
    ) -> Result<ReplicaRecord, GridError> {
        let policy = self.policy.vault_path_policy(&archive)?;
        let physical = self.paths.resolve(&policy, &archive, path, &session.user)?;
        Ok(ReplicaRecord::new(path.clone(), number, archive, physical))
    }

    /// Places a new, empty replica on `destination` (a resource or group).
    fn new_replica<'s>(
        &'s self,
        session: &mut Session,
        request: &OpenRequest,
        destination: &ResourceName,
        number: ReplicaNumber,
        source: Option<&ReplicaRecord>,
        others: Vec<ReplicaRecord>,
        undo: &mut UndoLog<'s>,
    ) -> Result<Selection, GridError> {
        let members = self.resources.resolve(destination)?;
        let quota_policy = self.policy.quota_policy();
        let requested = request.data_size.unwrap_or(0);

        if let Some(archive) = members.iter().find(|m| m.class == ResourceClass::Archive) {
            let cache = self.resources.cache_for(archive)?;
            let cache = session
                .quota
                .filter(quota_policy, &*self.catalog, &session.user, vec![cache], requested)?
                .into_iter()
                .next()
                .ok_or(GridError::QuotaExceeded { requested })?;
            let (primary, file) =
                self.create_empty_replica(session, request, &cache, number, source, undo)?;
            let record =
                self.archive_record(session, &request.path, archive.clone(), number.next())?;
            debug!(
                path = %request.path,
                cache = %cache.name,
                archive = %archive.name,
                "new compound replica"
            );
            return Ok(Selection {
                primary,
                others,
                sync_target: Some(SyncTarget {
                    record,
                    registered: false,
                }),
                created: Some(file),
            });
        }

        let writable: Vec<_> = members
            .into_iter()
            .filter(|m| m.class != ResourceClass::Bundle)
            .collect();
        if writable.is_empty() {
            return Err(GridError::NoUsableGroupMember {
                group: destination.clone(),
                wanted: "writable",
            });
        }
        let candidates =
            session
                .quota
                .filter(quota_policy, &*self.catalog, &session.user, writable, requested)?;

        let mut last_error = None;
        for resource in &candidates {
            match self.create_empty_replica(session, request, resource, number, source, undo) {
                Ok((primary, file)) => {
                    return Ok(Selection {
                        primary,
                        others,
                        sync_target: None,
                        created: Some(file),
                    });
                }
                Err(err) if err.is_resource_state() => {
                    warn!(
                        resource = %resource.name,
                        error = %err,
                        "resource unusable, trying next member"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(GridError::NoUsableGroupMember {
            group: destination.clone(),
            wanted: "writable",
        }))
    }

    /// Creates and registers an empty replica on `resource`.
    ///
    /// Either every step sticks (and its inverse joins `undo`) or none does.
    fn create_empty_replica<'s>(
        &'s self,
        session: &Session,
        request: &OpenRequest,
        resource: &ResourceIdentity,
        number: ReplicaNumber,
        source: Option<&ReplicaRecord>,
        undo: &mut UndoLog<'s>,
    ) -> Result<(ReplicaRecord, FileHandle), GridError> {
        let driver: &'s dyn FileDriver = self.drivers.for_resource(resource)?;
        let explicit = request.physical_path.is_some();
        let candidate = match &request.physical_path {
            Some(path) => {
                self.paths.check_len(path)?;
                path.clone()
            }
            None => {
                let policy = self.policy.vault_path_policy(resource)?;
                self.paths
                    .resolve(&policy, resource, &request.path, &session.user)?
            }
        };
        let physical = self
            .orphans
            .claim(resource, candidate, &session.user, number, explicit)?;

        let mut local = UndoLog::new();
        let file = driver.create(&physical, &resource.host)?;
        {
            let path = physical.clone();
            let host = resource.host.clone();
            local.push("remove new replica file", move || {
                driver.unlink(&path, &host).map_err(GridError::from)
            });
        }

        let mut record =
            ReplicaRecord::new(request.path.clone(), number, resource.clone(), physical)
                .with_size(0)
                .with_status(ReplicaStatus::NewlyCreated);
        if let ChecksumMode::Register(checksum) = &request.checksum {
            record.checksum = Some(checksum.clone());
        }
        if let Err(err) = self.catalog.register_replica(&record, source) {
            drop(file);
            return Err(local.rollback(err.into()));
        }
        {
            let catalog = &*self.catalog;
            let row = record.clone();
            local.push("unregister new replica", move || {
                catalog.unregister_replica(&row).map_err(GridError::from)
            });
        }

        undo.absorb(local);
        info!(
            path = %record.logical_path,
            replica = %record.replica_number,
            resource = %resource.name,
            physical = %record.physical_path.display(),
            "created empty replica"
        );
        Ok((record, file))
    }

    // ------------------------------------------------------------------------
    // I/O and close
    // ------------------------------------------------------------------------

    /// Writes through a physically opened write descriptor, locally or on
    /// the zone that opened it.
    pub fn write(
        &self,
        session: &mut Session,
        handle: LogicalHandle,
        buf: &[u8],
    ) -> Result<usize, GridError> {
        self.check_writable(session, handle)?;
        let written = match session.descriptors.get(handle)?.physical().clone() {
            PhysicalLink::Remote(remote) => {
                self.zones
                    .write_remote(&remote.host, remote.remote_index, buf)?
            }
            _ => {
                let (resource, linked) = self.local_file(session, handle)?;
                let driver = self.drivers.for_resource(&resource)?;
                let physical = session.descriptors.physical_mut(linked)?;
                let file = physical.file.as_mut().ok_or_else(|| {
                    GridError::Internal(format!("descriptor {handle} has no open file"))
                })?;
                driver.write(file, buf)?
            }
        };
        self.record_write(session, handle, written as u64)?;
        Ok(written)
    }

    /// Reads at `offset` through a physically opened descriptor.
    pub fn read_at(
        &self,
        session: &Session,
        handle: LogicalHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, GridError> {
        if let PhysicalLink::Remote(remote) = session.descriptors.get(handle)?.physical() {
            return Ok(self
                .zones
                .read_remote(&remote.host, remote.remote_index, offset, buf)?);
        }
        let (resource, linked) = self.local_file(session, handle)?;
        let driver = self.drivers.for_resource(&resource)?;
        let physical = session.descriptors.physical(linked)?;
        let file = physical
            .file
            .as_ref()
            .ok_or_else(|| GridError::Internal(format!("descriptor {handle} has no open file")))?;
        Ok(driver.read_at(file, offset, buf)?)
    }

    fn local_file(
        &self,
        session: &Session,
        handle: LogicalHandle,
    ) -> Result<(ResourceIdentity, PhysicalHandle), GridError> {
        let descriptor = session.descriptors.get(handle)?;
        match (descriptor.primary(), descriptor.physical()) {
            (Some(primary), PhysicalLink::Local(linked)) => Ok((primary.resource.clone(), *linked)),
            _ => Err(GridError::Internal(format!(
                "descriptor {handle} is not open on a local file"
            ))),
        }
    }

    /// Accounts `bytes` written through `handle` against the descriptor and
    /// the session's quota cache.
    pub fn record_write(
        &self,
        session: &mut Session,
        handle: LogicalHandle,
        bytes: u64,
    ) -> Result<(), GridError> {
        self.check_writable(session, handle)?;
        let descriptor = session.descriptors.get_mut(handle)?;
        descriptor.add_written(bytes);
        // Remote descriptors have no primary; their zone charges the quota
        if let Some(primary) = descriptor.primary() {
            let resource = primary.resource.name.clone();
            session.quota.record_write(&resource, bytes);
        }
        Ok(())
    }

    fn check_writable(&self, session: &Session, handle: LogicalHandle) -> Result<(), GridError> {
        if session.descriptors.get(handle)?.intent() != Some(OpenIntent::Write) {
            return Err(GridError::PermissionDenied {
                user: session.user.clone(),
                action: "write through a read descriptor",
            });
        }
        Ok(())
    }

    /// Closes `handle`. The slot is freed even when a close step fails; the
    /// first failure is returned.
    pub fn close(&self, session: &mut Session, handle: LogicalHandle) -> Result<(), GridError> {
        let Released {
            descriptor,
            physical,
        } = session.descriptors.free(handle)?;
        let parts = descriptor.into_parts();

        if let PhysicalLink::Remote(remote) = &parts.physical {
            self.zones.close_remote(&remote.host, remote.remote_index)?;
            debug!(
                host = %remote.host,
                remote_index = remote.remote_index,
                "closed remote descriptor"
            );
            return Ok(());
        }
        let Some(primary) = parts.primary else {
            return Ok(());
        };

        let driver = self.drivers.for_resource(&primary.resource)?;
        let mut first_error = None;
        if let Some(file) = physical.and_then(|p| p.file) {
            keep_first(&mut first_error, driver.close(file).map_err(GridError::from));
        }

        let truncated = parts.request.as_ref().is_some_and(|r| r.truncate);
        let intent = parts.request.as_ref().map(|r| r.intent);
        let purge = parts.request.as_ref().is_some_and(|r| r.purge_cache);
        let mut synced = false;

        if intent == Some(OpenIntent::Write) {
            let size = match driver.stat(&primary.physical_path, &primary.resource.host) {
                Ok(stat) => stat.size,
                Err(err) => {
                    keep_first(&mut first_error, Err(err.into()));
                    parts.bytes_written
                }
            };
            keep_first(
                &mut first_error,
                self.catalog
                    .update_replica_size(&primary, size)
                    .map_err(GridError::from),
            );
            if primary.status != ReplicaStatus::Current {
                keep_first(
                    &mut first_error,
                    self.catalog
                        .update_replica_status(&primary, ReplicaStatus::Current)
                        .map_err(GridError::from),
                );
            }
            let written = ReplicaRecord {
                size: Some(size),
                status: ReplicaStatus::Current,
                ..primary.clone()
            };

            if let Some(target) = &parts.sync_target {
                match self.sync_on_close(&written, target) {
                    Ok(()) => synced = true,
                    Err(err) => keep_first(&mut first_error, Err(err)),
                }
            }

            if parts.bytes_written > 0 || truncated {
                let synced_number = parts
                    .sync_target
                    .as_ref()
                    .filter(|_| synced)
                    .map(|t| (t.record.resource.name.clone(), t.record.replica_number));
                for other in &parts.others {
                    let is_synced = synced_number.as_ref().is_some_and(|(name, number)| {
                        &other.resource.name == name && other.replica_number == *number
                    });
                    if is_synced || other.status.is_superseded() {
                        continue;
                    }
                    keep_first(
                        &mut first_error,
                        self.catalog
                            .update_replica_status(other, ReplicaStatus::OldCopy)
                            .map_err(GridError::from),
                    );
                }
            }
        }

        if purge && primary.class() == ResourceClass::Cache {
            let archived = synced
                || parts
                    .others
                    .iter()
                    .any(|r| r.class() == ResourceClass::Archive && !r.status.is_superseded());
            if archived {
                keep_first(&mut first_error, self.purge_cache_copy(driver, &primary));
            }
        }

        debug!(descriptor = handle.index(), path = %primary.logical_path, "closed descriptor");
        first_error.map_or(Ok(()), Err)
    }

    fn sync_on_close(
        &self,
        cache_copy: &ReplicaRecord,
        target: &SyncTarget,
    ) -> Result<(), GridError> {
        let bytes = self.archive.sync_to_archive(
            cache_copy,
            &target.record.resource,
            &target.record.physical_path,
        )?;
        if target.registered {
            self.catalog.update_replica_size(&target.record, bytes)?;
            self.catalog
                .update_replica_status(&target.record, ReplicaStatus::Current)?;
        } else {
            let record = target.record.clone().with_size(bytes);
            self.catalog.register_replica(&record, Some(cache_copy))?;
        }
        info!(
            path = %cache_copy.logical_path,
            archive = %target.record.resource.name,
            bytes,
            "synced cache replica to archive"
        );
        Ok(())
    }

    fn purge_cache_copy(
        &self,
        driver: &dyn FileDriver,
        cache_copy: &ReplicaRecord,
    ) -> Result<(), GridError> {
        driver.unlink(&cache_copy.physical_path, &cache_copy.resource.host)?;
        self.catalog.unregister_replica(cache_copy)?;
        debug!(
            path = %cache_copy.logical_path,
            resource = %cache_copy.resource.name,
            "purged cache replica"
        );
        Ok(())
    }

    /// Closes the file of a descriptor released by a failed open.
    fn close_released_file(&self, released: Released) {
        let Some(file) = released.physical.and_then(|p| p.file) else {
            return;
        };
        let Some(primary) = released.descriptor.primary() else {
            return;
        };
        if let Ok(driver) = self.drivers.for_resource(&primary.resource) {
            if let Err(err) = driver.close(file) {
                warn!(path = %primary.logical_path, error = %err, "close after failed open");
            }
        }
    }
}

fn keep_first(slot: &mut Option<GridError>, result: Result<(), GridError>) {
    if let Err(err) = result {
        warn!(error = %err, "close step failed");
        slot.get_or_insert(err);
    }
}
