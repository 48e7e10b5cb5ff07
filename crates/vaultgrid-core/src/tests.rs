//! Engine tests for vaultgrid-core
//!
//! Every test runs the open engine against real vault directories in a
//! temporary tree, the local file driver and an in-memory catalog.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use test_case::test_case;
use vaultgrid_io::{FileDriver, LocalDriver};
use vaultgrid_types::{
    LogicalPath, ReplicaNumber, ReplicaRecord, ReplicaStatus, ResourceCategory, ResourceClass,
    ResourceIdentity, ResourceName,
};

use crate::catalog::{Catalog, CatalogError, MemoryCatalog, ReplicaSelector};
use crate::descriptor::{PhysicalLink, RESERVED_SLOTS};
use crate::open::{
    ChecksumMode, EngineSettings, OpenEngine, OpenIntent, OpenRequest, PhysicalOpenPolicy,
};
use crate::orphan::ReconcileOutcome;
use crate::policy::{
    OpenContext, PolicyError, PolicyHooks, QuotaPolicy, StaticPolicy, VaultPathPolicy,
};
use crate::quota::QuotaUsage;
use crate::resource::{DriverRegistry, ResourceTable};
use crate::zone::{RemoteError, RemoteOpenResult, ZoneRouter};
use crate::{GridError, LocalArchive};

const HOST: &str = "localhost";

// ============================================================================
// Test Helpers
// ============================================================================

fn lp(path: &str) -> LogicalPath {
    LogicalPath::new(path).unwrap()
}

fn alice(name: &str) -> LogicalPath {
    lp(&format!("/tempZone/home/alice/{name}"))
}

/// Vaults under a temporary root, an engine over them, and the catalog
/// behind it.
struct Grid {
    _dir: TempDir,
    root: PathBuf,
    catalog: Arc<MemoryCatalog>,
    engine: OpenEngine,
}

impl Grid {
    fn new() -> Self {
        Self::build(
            Arc::new(StaticPolicy::default()),
            EngineSettings::default(),
            |memory| memory as Arc<dyn Catalog>,
        )
    }

    fn with_policy(policy: StaticPolicy) -> Self {
        Self::build(Arc::new(policy), EngineSettings::default(), |memory| {
            memory as Arc<dyn Catalog>
        })
    }

    fn with_settings(settings: EngineSettings) -> Self {
        Self::build(Arc::new(StaticPolicy::default()), settings, |memory| {
            memory as Arc<dyn Catalog>
        })
    }

    fn build(
        policy: Arc<dyn PolicyHooks>,
        settings: EngineSettings,
        wrap: impl FnOnce(Arc<MemoryCatalog>) -> Arc<dyn Catalog>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let resources = vec![
            ResourceIdentity::new("demo", HOST, ResourceClass::Normal, root.join("demo")),
            ResourceIdentity::new("spare", HOST, ResourceClass::Normal, root.join("spare")),
            ResourceIdentity::new("cache1", HOST, ResourceClass::Cache, root.join("cache"))
                .with_group("pair"),
            ResourceIdentity::new("arch1", HOST, ResourceClass::Archive, root.join("arch"))
                .with_group("pair"),
            ResourceIdentity::new("bun1", HOST, ResourceClass::Bundle, root.join("bundle"))
                .with_group("pair"),
            ResourceIdentity::new("q1", HOST, ResourceClass::Normal, root.join("q1"))
                .with_group("qgroup"),
            ResourceIdentity::new("q2", HOST, ResourceClass::Normal, root.join("q2"))
                .with_group("qgroup"),
            ResourceIdentity::new("far", "far.example", ResourceClass::Normal, root.join("far"))
                .with_group("mixed"),
            ResourceIdentity::new("near", HOST, ResourceClass::Normal, root.join("near"))
                .with_group("mixed"),
        ];

        let driver: Arc<dyn FileDriver> = Arc::new(LocalDriver::new(HOST));
        let drivers = DriverRegistry::new()
            .with_driver(ResourceCategory::FileSystem, Arc::clone(&driver))
            .with_driver(ResourceCategory::Structured, driver);
        let memory = Arc::new(MemoryCatalog::new());
        let engine = OpenEngine::new(
            settings,
            ResourceTable::new(resources),
            wrap(Arc::clone(&memory)),
            policy,
            drivers,
            Arc::new(LocalArchive::new(HOST)),
        );

        Self {
            _dir: dir,
            root,
            catalog: memory,
            engine,
        }
    }

    fn with_zone(self, zones: Arc<dyn ZoneRouter>) -> Self {
        Self {
            engine: self.engine.with_zone_router(zones),
            ..self
        }
    }

    fn resource(&self, name: &str) -> ResourceIdentity {
        self.engine
            .resources()
            .get(&ResourceName::from(name))
            .cloned()
            .unwrap()
    }

    /// Graft (trim one) location of `logical` on `resource`.
    fn vault_file(&self, resource: &str, logical: &LogicalPath) -> PathBuf {
        let rel: PathBuf = logical.segments().skip(1).collect();
        self.resource(resource).vault_path.join(rel)
    }

    fn seed_at(
        &self,
        logical: &LogicalPath,
        number: u32,
        resource: &str,
        physical: &Path,
        contents: &[u8],
    ) -> ReplicaRecord {
        fs::create_dir_all(physical.parent().unwrap()).unwrap();
        fs::write(physical, contents).unwrap();
        let record = ReplicaRecord::new(
            logical.clone(),
            ReplicaNumber::new(number),
            self.resource(resource),
            physical,
        )
        .with_size(contents.len() as u64);
        self.catalog.insert(record.clone());
        record
    }

    /// Writes `contents` at the graft location and catalogs it.
    fn seed(
        &self,
        logical: &LogicalPath,
        number: u32,
        resource: &str,
        contents: &[u8],
    ) -> ReplicaRecord {
        let physical = self.vault_file(resource, logical);
        self.seed_at(logical, number, resource, &physical, contents)
    }

    fn replicas(&self, logical: &LogicalPath) -> Vec<ReplicaRecord> {
        self.catalog
            .find_replicas(logical, &ReplicaSelector::default())
            .unwrap()
    }

    fn replica(&self, logical: &LogicalPath, number: u32) -> ReplicaRecord {
        self.catalog
            .find_replicas(
                logical,
                &ReplicaSelector {
                    replica_number: Some(ReplicaNumber::new(number)),
                },
            )
            .unwrap()
            .pop()
            .unwrap()
    }
}

fn entries(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(read) => read
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Catalog whose writes can be made to fail.
struct FailingCatalog {
    inner: Arc<MemoryCatalog>,
    fail_register: bool,
    fail_path_update: bool,
}

impl FailingCatalog {
    fn failure() -> CatalogError {
        CatalogError::Backend("database unavailable".to_string())
    }
}

impl Catalog for FailingCatalog {
    fn find_replicas(
        &self,
        path: &LogicalPath,
        selector: &ReplicaSelector,
    ) -> Result<Vec<ReplicaRecord>, CatalogError> {
        self.inner.find_replicas(path, selector)
    }

    fn register_replica(
        &self,
        new: &ReplicaRecord,
        source: Option<&ReplicaRecord>,
    ) -> Result<(), CatalogError> {
        if self.fail_register {
            return Err(Self::failure());
        }
        self.inner.register_replica(new, source)
    }

    fn unregister_replica(&self, record: &ReplicaRecord) -> Result<(), CatalogError> {
        self.inner.unregister_replica(record)
    }

    fn update_replica_path(
        &self,
        record: &ReplicaRecord,
        new_path: &Path,
    ) -> Result<(), CatalogError> {
        if self.fail_path_update {
            return Err(Self::failure());
        }
        self.inner.update_replica_path(record, new_path)
    }

    fn update_replica_size(&self, record: &ReplicaRecord, size: u64) -> Result<(), CatalogError> {
        self.inner.update_replica_size(record, size)
    }

    fn update_replica_status(
        &self,
        record: &ReplicaRecord,
        status: ReplicaStatus,
    ) -> Result<(), CatalogError> {
        self.inner.update_replica_status(record, status)
    }

    fn find_by_physical_path(
        &self,
        resource: &ResourceName,
        path: &Path,
    ) -> Result<Option<ReplicaRecord>, CatalogError> {
        self.inner.find_by_physical_path(resource, path)
    }

    fn quota_usage(&self, user: &str) -> Result<QuotaUsage, CatalogError> {
        self.inner.quota_usage(user)
    }
}

fn failing_grid(fail_register: bool, fail_path_update: bool) -> Grid {
    Grid::build(
        Arc::new(StaticPolicy::default()),
        EngineSettings::default(),
        move |memory| {
            Arc::new(FailingCatalog {
                inner: memory,
                fail_register,
                fail_path_update,
            })
        },
    )
}

/// Zone router that serves `otherZone` remotely.
#[derive(Default)]
struct FakeZone {
    fail_open: bool,
    closed: Mutex<Vec<(String, i32)>>,
    written: Mutex<Vec<u8>>,
}

const REMOTE_BYTES: &[u8] = b"remote bytes";

impl ZoneRouter for FakeZone {
    fn is_local(&self, path: &LogicalPath) -> bool {
        path.zone() != "otherZone"
    }

    fn host_for(&self, _path: &LogicalPath) -> Result<String, RemoteError> {
        Ok("icat.other.example".to_string())
    }

    fn open_remote(
        &self,
        host: &str,
        _request: &OpenRequest,
    ) -> Result<RemoteOpenResult, RemoteError> {
        if self.fail_open {
            return Err(RemoteError {
                host: host.to_string(),
                code: -808_000,
                message: "no such object".to_string(),
            });
        }
        Ok(RemoteOpenResult {
            remote_index: 9,
            size: Some(12),
            mode: 0o600,
            data_type: "generic".to_string(),
            physical_index: Some(4),
        })
    }

    fn read_remote(
        &self,
        _host: &str,
        _remote_index: i32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        let rest = REMOTE_BYTES.get(offset as usize..).unwrap_or_default();
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }

    fn write_remote(
        &self,
        _host: &str,
        _remote_index: i32,
        buf: &[u8],
    ) -> Result<usize, RemoteError> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close_remote(&self, host: &str, remote_index: i32) -> Result<(), RemoteError> {
        self.closed
            .lock()
            .unwrap()
            .push((host.to_string(), remote_index));
        Ok(())
    }
}

/// Policy that refuses every open.
struct VetoPolicy(StaticPolicy);

impl PolicyHooks for VetoPolicy {
    fn preprocess_open(&self, ctx: &mut OpenContext<'_>) -> Result<(), PolicyError> {
        Err(PolicyError::Vetoed {
            reason: format!("{} may not open {}", ctx.user, ctx.path),
        })
    }

    fn vault_path_policy(
        &self,
        resource: &ResourceIdentity,
    ) -> Result<VaultPathPolicy, PolicyError> {
        self.0.vault_path_policy(resource)
    }

    fn quota_policy(&self) -> QuotaPolicy {
        self.0.quota_policy()
    }

    fn default_resource(&self, path: &LogicalPath) -> Option<ResourceName> {
        self.0.default_resource(path)
    }
}

// ============================================================================
// Create-on-open
// ============================================================================

#[test]
fn create_on_open_registers_one_replica() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");
    let path = alice("new.dat");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("demo"))
        .unwrap();
    assert!(outcome.physically_opened);
    assert!(outcome.index() >= RESERVED_SLOTS as i32);

    let rows = grid.replicas(&path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ReplicaStatus::NewlyCreated);
    assert_eq!(rows[0].size, Some(0));
    assert_eq!(rows[0].physical_path, grid.vault_file("demo", &path));
    assert!(rows[0].physical_path.is_file());

    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert_eq!(descriptor.intent(), Some(OpenIntent::Write));
    assert!(matches!(descriptor.physical(), PhysicalLink::Local(_)));

    assert_eq!(grid.engine.write(&mut session, outcome.handle, b"hello").unwrap(), 5);
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let row = grid.replica(&path, 0);
    assert_eq!(row.status, ReplicaStatus::Current);
    assert_eq!(row.size, Some(5));
    assert_eq!(fs::read(&row.physical_path).unwrap(), b"hello");
    assert_eq!(session.descriptors().logical_in_use(), 0);
    assert_eq!(session.descriptors().physical_in_use(), 0);
}

#[test]
fn create_without_destination_is_rejected() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::create(alice("nowhere.dat")))
        .unwrap_err();
    assert!(matches!(err, GridError::NoResourceForCreate { .. }));
    assert_eq!(err.code(), -311_000);
    assert_eq!(session.descriptors().logical_in_use(), 0);
    assert!(grid.catalog.records().is_empty());
}

#[test]
fn create_uses_policy_default_resource() {
    let grid = Grid::with_policy(StaticPolicy::default().with_default_resource("spare"));
    let mut session = grid.engine.session("alice");
    let path = alice("defaulted.dat");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()))
        .unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    assert_eq!(grid.replica(&path, 0).resource.name.as_str(), "spare");
}

#[test]
fn create_registers_requested_checksum() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");
    let path = alice("summed.dat");

    let request = OpenRequest::create(path.clone())
        .on_resource("demo")
        .with_checksum(ChecksumMode::Register("sha2:q83v".to_string()));
    let outcome = grid.engine.open(&mut session, request).unwrap();

    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert_eq!(
        descriptor.checksum(),
        Some(&ChecksumMode::Register("sha2:q83v".to_string()))
    );
    assert_eq!(grid.replica(&path, 0).checksum.as_deref(), Some("sha2:q83v"));
}

#[test]
fn read_of_missing_object_is_not_found() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::read(alice("ghost.dat")))
        .unwrap_err();
    assert!(matches!(err, GridError::ObjectNotFound { .. }));
    assert_eq!(session.descriptors().logical_in_use(), 0);
}

#[test]
fn failed_registration_leaves_no_file_or_slot() {
    let grid = failing_grid(true, false);
    let mut session = grid.engine.session("alice");
    let path = alice("doomed.dat");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("demo"))
        .unwrap_err();
    assert!(matches!(err, GridError::Catalog(CatalogError::Backend(_))));
    assert!(!grid.vault_file("demo", &path).exists());
    assert_eq!(session.descriptors().logical_in_use(), 0);
    assert_eq!(session.descriptors().physical_in_use(), 0);
}

#[test]
fn unusable_group_member_is_skipped() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");
    let path = alice("mixed.dat");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("mixed"))
        .unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let rows = grid.replicas(&path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].resource.name.as_str(), "near");
}

// ============================================================================
// Descriptor tables
// ============================================================================

#[test]
fn descriptor_exhaustion_recovers_after_close() {
    let grid = Grid::with_settings(EngineSettings {
        logical_capacity: RESERVED_SLOTS + 2,
        ..EngineSettings::default()
    });
    let path = alice("shared.dat");
    grid.seed(&path, 0, "demo", b"shared");
    let mut session = grid.engine.session("alice");

    let first = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();
    grid.engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();

    let err = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap_err();
    assert!(matches!(err, GridError::OutOfDescriptors { table: "logical", .. }));
    assert_eq!(err.code(), -340_000);

    grid.engine.close(&mut session, first.handle).unwrap();
    let again = grid
        .engine
        .open(&mut session, OpenRequest::read(path))
        .unwrap();
    assert_eq!(again.index(), first.index());
}

#[test]
fn raw_index_resolves_until_close() {
    let grid = Grid::new();
    let path = alice("indexed.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::read(path))
        .unwrap();
    assert_eq!(session.resolve(outcome.index()).unwrap(), outcome.handle);

    grid.engine.close(&mut session, outcome.handle).unwrap();
    assert!(matches!(
        session.resolve(outcome.index()),
        Err(GridError::BadDescriptor { .. })
    ));
    assert!(matches!(
        grid.engine.close(&mut session, outcome.handle),
        Err(GridError::BadDescriptor { .. })
    ));
}

// ============================================================================
// Physical open policy
// ============================================================================

#[test]
fn small_read_skips_physical_open() {
    let grid = Grid::new();
    let path = alice("small.dat");
    grid.seed(&path, 0, "demo", b"hello");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(path).with_physical_open(PhysicalOpenPolicy::BySize),
        )
        .unwrap();
    assert!(!outcome.physically_opened);
    assert_eq!(session.descriptors().physical_in_use(), 0);
    assert_eq!(
        session.descriptors().get(outcome.handle).unwrap().data_size(),
        Some(5)
    );
}

#[test]
fn large_read_opens_physically() {
    let grid = Grid::with_settings(EngineSettings {
        single_buffer_bytes: 4,
        ..EngineSettings::default()
    });
    let path = alice("large.dat");
    grid.seed(&path, 0, "demo", b"hello");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(path).with_physical_open(PhysicalOpenPolicy::BySize),
        )
        .unwrap();
    assert!(outcome.physically_opened);

    let mut buf = [0u8; 5];
    let read = grid
        .engine
        .read_at(&session, outcome.handle, 0, &mut buf)
        .unwrap();
    assert_eq!(&buf[..read], b"hello");
}

#[test]
fn metadata_only_create_still_creates_the_replica() {
    let grid = Grid::new();
    let mut session = grid.engine.session("alice");
    let path = alice("inline.dat");

    let request = OpenRequest::create(path.clone())
        .on_resource("demo")
        .with_data_included()
        .with_physical_open(PhysicalOpenPolicy::BySize);
    let outcome = grid.engine.open(&mut session, request).unwrap();

    assert!(!outcome.physically_opened);
    assert_eq!(session.descriptors().physical_in_use(), 0);
    assert!(grid.vault_file("demo", &path).is_file());
    assert_eq!(grid.replicas(&path).len(), 1);
}

#[test]
fn truncating_write_resets_size() {
    let grid = Grid::new();
    let path = alice("trunc.dat");
    let seeded = grid.seed(&path, 0, "demo", b"hello");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::write(path.clone()).truncating())
        .unwrap();
    assert_eq!(grid.replica(&path, 0).size, Some(0));
    assert_eq!(
        session.descriptors().get(outcome.handle).unwrap().data_size(),
        Some(0)
    );
    assert_eq!(fs::metadata(&seeded.physical_path).unwrap().len(), 0);
}

#[test]
fn truncating_write_without_physical_slot_keeps_data() {
    let grid = Grid::with_settings(EngineSettings {
        physical_capacity: RESERVED_SLOTS + 1,
        ..EngineSettings::default()
    });
    let busy = alice("busy.dat");
    let path = alice("keep.dat");
    grid.seed(&busy, 0, "demo", b"abc");
    let seeded = grid.seed(&path, 0, "demo", b"thirteen byte");
    let mut session = grid.engine.session("alice");

    let reader = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(busy).with_physical_open(PhysicalOpenPolicy::Always),
        )
        .unwrap();
    let truncating = || {
        OpenRequest::write(path.clone())
            .truncating()
            .with_physical_open(PhysicalOpenPolicy::Always)
    };

    let err = grid.engine.open(&mut session, truncating()).unwrap_err();
    assert!(matches!(err, GridError::OutOfDescriptors { .. }));
    assert_eq!(fs::read(&seeded.physical_path).unwrap(), b"thirteen byte");
    assert_eq!(grid.replica(&path, 0).size, Some(13));
    assert_eq!(session.descriptors().physical_in_use(), 1);

    grid.engine.close(&mut session, reader.handle).unwrap();
    grid.engine.open(&mut session, truncating()).unwrap();
    assert_eq!(fs::metadata(&seeded.physical_path).unwrap().len(), 0);
    assert_eq!(grid.replica(&path, 0).size, Some(0));
}

// ============================================================================
// Writes to existing objects
// ============================================================================

#[test]
fn write_marks_other_replicas_old() {
    let grid = Grid::new();
    let path = alice("twice.dat");
    grid.seed(&path, 0, "demo", b"aaa");
    grid.seed(&path, 1, "spare", b"aaa");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::write(path.clone()).on_resource("demo"))
        .unwrap();
    assert_eq!(
        session
            .descriptors()
            .get(outcome.handle)
            .unwrap()
            .others()
            .len(),
        1
    );
    grid.engine.write(&mut session, outcome.handle, b"bbbb").unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let written = grid.replica(&path, 0);
    assert_eq!(written.size, Some(4));
    assert_eq!(written.status, ReplicaStatus::Current);
    assert_eq!(grid.replica(&path, 1).status, ReplicaStatus::OldCopy);
}

#[test]
fn write_to_resource_without_copy_adds_replica() {
    let grid = Grid::new();
    let path = alice("spread.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::write(path.clone()).on_resource("spare"))
        .unwrap();
    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert_eq!(descriptor.primary().unwrap().replica_number, ReplicaNumber::new(1));
    assert_eq!(descriptor.others().len(), 1);

    let rows = grid.replicas(&path);
    assert_eq!(rows.len(), 2);
    assert!(grid.vault_file("spare", &path).is_file());
}

#[test]
fn read_from_resource_without_copy_fails() {
    let grid = Grid::new();
    let path = alice("only-demo.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::read(path).on_resource("spare"))
        .unwrap_err();
    assert!(matches!(err, GridError::NoMatchingReplica { .. }));
    assert_eq!(err.code(), -321_000);
}

#[test]
fn write_through_read_descriptor_is_refused() {
    let grid = Grid::new();
    let path = alice("ro.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::read(path))
        .unwrap();
    let err = grid
        .engine
        .record_write(&mut session, outcome.handle, 3)
        .unwrap_err();
    assert!(matches!(err, GridError::PermissionDenied { .. }));
}

#[test]
fn preprocess_veto_frees_the_slot() {
    let grid = Grid::build(
        Arc::new(VetoPolicy(StaticPolicy::default())),
        EngineSettings::default(),
        |memory| memory as Arc<dyn Catalog>,
    );
    let path = alice("vetoed.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::read(path))
        .unwrap_err();
    assert!(matches!(err, GridError::Policy(PolicyError::Vetoed { .. })));
    assert_eq!(err.code(), -362_000);
    assert_eq!(session.descriptors().logical_in_use(), 0);
}

// ============================================================================
// Orphan reconciliation
// ============================================================================

#[test]
fn orphan_file_is_relocated_before_create() {
    let grid = Grid::new();
    let path = alice("orphaned.dat");
    let physical = grid.vault_file("demo", &path);
    fs::create_dir_all(physical.parent().unwrap()).unwrap();
    fs::write(&physical, b"stray bytes").unwrap();
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("demo"))
        .unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    assert_eq!(fs::read(&physical).unwrap(), b"");
    let parked_dir = grid.root.join("demo/orphan/home/alice");
    let parked = entries(&parked_dir);
    assert_eq!(parked.len(), 1);
    assert!(parked[0].starts_with("orphaned.dat."));
    assert_eq!(fs::read(parked_dir.join(&parked[0])).unwrap(), b"stray bytes");
}

#[test]
fn reconcile_reports_each_outcome() {
    let grid = Grid::new();
    let demo = grid.resource("demo");
    let reconciler = grid.engine.orphans();

    let vacant = grid.root.join("demo/home/alice/none.dat");
    assert_eq!(
        reconciler.reconcile(&demo, &vacant, "alice").unwrap(),
        ReconcileOutcome::Vacant
    );

    let stray = grid.root.join("demo/home/alice/stray.dat");
    fs::create_dir_all(stray.parent().unwrap()).unwrap();
    fs::write(&stray, b"x").unwrap();
    match reconciler.reconcile(&demo, &stray, "alice").unwrap() {
        ReconcileOutcome::Relocated { to } => {
            assert!(!stray.exists());
            assert!(to.is_file());
            assert!(to.starts_with(grid.root.join("demo/orphan")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let live = grid.seed(&alice("live.dat"), 0, "demo", b"live");
    assert!(matches!(
        reconciler.reconcile(&demo, &live.physical_path, "alice").unwrap(),
        ReconcileOutcome::InUse { .. }
    ));
    assert!(live.physical_path.is_file());
}

#[test]
fn old_copy_moves_to_history_and_catalog_follows() {
    let grid = Grid::new();
    let demo = grid.resource("demo");
    let path = alice("old.dat");
    let physical = grid.vault_file("demo", &path);
    grid.catalog.insert(
        ReplicaRecord::new(path.clone(), ReplicaNumber::new(0), demo.clone(), &physical)
            .with_status(ReplicaStatus::OldCopy),
    );
    fs::create_dir_all(physical.parent().unwrap()).unwrap();
    fs::write(&physical, b"old").unwrap();

    let outcome = grid
        .engine
        .orphans()
        .reconcile(&demo, &physical, "alice")
        .unwrap();
    let to = match outcome {
        ReconcileOutcome::HistoryMoved { to, .. } => to,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(to.starts_with(grid.root.join("demo/replica/home/alice")));
    assert!(!physical.exists());
    assert_eq!(fs::read(&to).unwrap(), b"old");
    assert_eq!(grid.replica(&path, 0).physical_path, to);
}

#[test]
fn trashed_replica_moves_to_history() {
    let grid = Grid::new();
    let demo = grid.resource("demo");
    let trashed = grid.seed(&lp("/tempZone/trash/home/alice/t.dat"), 0, "demo", b"t");

    let outcome = grid
        .engine
        .orphans()
        .reconcile(&demo, &trashed.physical_path, "alice")
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::HistoryMoved { .. }));
    assert!(!trashed.physical_path.exists());
}

#[test]
fn failed_catalog_update_restores_the_file() {
    let grid = failing_grid(false, true);
    let demo = grid.resource("demo");
    let path = alice("pinned.dat");
    let physical = grid.vault_file("demo", &path);
    grid.catalog.insert(
        ReplicaRecord::new(path.clone(), ReplicaNumber::new(0), demo.clone(), &physical)
            .with_status(ReplicaStatus::Stale),
    );
    fs::create_dir_all(physical.parent().unwrap()).unwrap();
    fs::write(&physical, b"keep me").unwrap();

    let err = grid
        .engine
        .orphans()
        .reconcile(&demo, &physical, "alice")
        .unwrap_err();
    assert!(matches!(err, GridError::Catalog(_)));
    assert_eq!(fs::read(&physical).unwrap(), b"keep me");
    assert!(entries(&grid.root.join("demo/replica/home/alice")).is_empty());
    assert_eq!(grid.replica(&path, 0).physical_path, physical);
}

#[test]
fn reconcile_refuses_unsafe_targets() {
    let grid = Grid::new();
    let demo = grid.resource("demo");
    let reconciler = grid.engine.orphans();

    let dir = grid.root.join("demo/home");
    fs::create_dir_all(&dir).unwrap();
    assert!(matches!(
        reconciler.reconcile(&demo, &dir, "alice"),
        Err(GridError::PathIsNotAFile { .. })
    ));

    let outside = grid.root.join("outside.txt");
    fs::write(&outside, b"x").unwrap();
    assert!(matches!(
        reconciler.reconcile(&demo, &outside, "alice"),
        Err(GridError::PathNotInVault { .. })
    ));

    let stray = grid.root.join("demo/home/stray.dat");
    fs::write(&stray, b"x").unwrap();
    assert!(matches!(
        reconciler.reconcile(&demo, &stray, "anonymous"),
        Err(GridError::PermissionDenied { .. })
    ));
    assert!(stray.is_file());
}

#[test]
fn occupied_path_gets_replica_suffix() {
    let grid = Grid::new();
    let path = alice("b.dat");
    let taken = grid.vault_file("demo", &path);
    grid.seed_at(&alice("other.dat"), 0, "demo", &taken, b"other");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("demo"))
        .unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let row = grid.replica(&path, 0);
    assert_eq!(row.physical_path, PathBuf::from(format!("{}.0", taken.display())));
    assert_eq!(fs::read(&taken).unwrap(), b"other");
}

#[test]
fn occupied_explicit_path_is_an_error() {
    let grid = Grid::new();
    let taken = grid.vault_file("demo", &alice("b.dat"));
    grid.seed_at(&alice("other.dat"), 0, "demo", &taken, b"other");
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(
            &mut session,
            OpenRequest::create(alice("explicit.dat"))
                .on_resource("demo")
                .at_physical_path(&taken),
        )
        .unwrap_err();
    assert!(matches!(err, GridError::PathInUse { .. }));
    assert_eq!(err.code(), -316_000);
    assert_eq!(grid.catalog.records().len(), 1);
    assert_eq!(session.descriptors().logical_in_use(), 0);
}

// ============================================================================
// Quota
// ============================================================================

#[test]
fn quota_steers_create_to_roomy_member() {
    let grid = Grid::with_policy(StaticPolicy::default().with_quota(QuotaPolicy::On));
    grid.catalog.insert(
        ReplicaRecord::new(alice("usage.dat"), ReplicaNumber::new(0), grid.resource("q1"), "/x")
            .with_size(95),
    );
    grid.catalog.set_quota("alice", Some("q1".into()), 100);
    let path = alice("q.dat");

    let mut session = grid.engine.session("alice");
    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::create(path.clone())
                .on_resource("qgroup")
                .with_data_size(10),
        )
        .unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();
    assert_eq!(grid.replica(&path, 0).resource.name.as_str(), "q2");

    grid.catalog.set_quota("alice", Some("q2".into()), 5);
    let mut fresh = grid.engine.session("alice");
    let err = grid
        .engine
        .open(
            &mut fresh,
            OpenRequest::create(alice("q-more.dat"))
                .on_resource("qgroup")
                .with_data_size(10),
        )
        .unwrap_err();
    assert!(matches!(err, GridError::QuotaExceeded { requested: 10 }));
    assert_eq!(err.code(), -350_000);
    assert_eq!(fresh.descriptors().logical_in_use(), 0);
}

#[test]
fn recorded_writes_feed_the_quota_cache() {
    let grid = Grid::with_policy(StaticPolicy::default().with_quota(QuotaPolicy::On));
    grid.catalog.set_quota("alice", Some("q1".into()), 1000);
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::create(alice("counted.dat")).on_resource("q1"),
        )
        .unwrap();
    grid.engine
        .write(&mut session, outcome.handle, &[7u8; 64])
        .unwrap();
    assert_eq!(
        session.quota().resource(&"q1".into()).unwrap().overrun,
        64
    );
}

// ============================================================================
// Compound and bundle resources
// ============================================================================

#[test]
fn compound_read_stages_once() {
    let grid = Grid::new();
    let path = alice("big.dat");
    grid.seed(&path, 0, "arch1", b"archived");
    let mut session = grid.engine.session("alice");

    let first = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();
    let descriptor = session.descriptors().get(first.handle).unwrap();
    let staged = descriptor.primary().unwrap().clone();
    assert_eq!(staged.class(), ResourceClass::Cache);
    assert_eq!(descriptor.others()[0].class(), ResourceClass::Archive);

    let mut buf = [0u8; 16];
    let read = grid
        .engine
        .read_at(&session, first.handle, 0, &mut buf)
        .unwrap();
    assert_eq!(&buf[..read], b"archived");
    grid.engine.close(&mut session, first.handle).unwrap();
    assert_eq!(grid.replicas(&path).len(), 2);

    let second = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();
    let again = session.descriptors().get(second.handle).unwrap().primary().unwrap();
    assert_eq!(again.replica_number, staged.replica_number);
    assert_eq!(again.physical_path, staged.physical_path);
    assert_eq!(grid.replicas(&path).len(), 2);
    assert_eq!(entries(&grid.root.join("cache/home/alice")), vec!["big.dat"]);
}

#[test]
fn archive_read_by_name_reuses_staged_copy() {
    let grid = Grid::new();
    let path = alice("named.dat");
    grid.seed(&path, 0, "arch1", b"archived");
    let mut session = grid.engine.session("alice");

    let first = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();
    let staged = session
        .descriptors()
        .get(first.handle)
        .unwrap()
        .primary()
        .unwrap()
        .clone();
    grid.engine.close(&mut session, first.handle).unwrap();

    let second = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(path.clone()).on_resource("arch1"),
        )
        .unwrap();
    let descriptor = session.descriptors().get(second.handle).unwrap();
    assert_eq!(descriptor.primary().unwrap().physical_path, staged.physical_path);
    assert!(
        descriptor
            .others()
            .iter()
            .any(|r| r.class() == ResourceClass::Archive)
    );
    assert_eq!(grid.replicas(&path).len(), 2);
    assert_eq!(entries(&grid.root.join("cache/home/alice")), vec!["named.dat"]);
}

#[test]
fn purge_cache_drops_staged_copy_on_close() {
    let grid = Grid::new();
    let path = alice("purged.dat");
    grid.seed(&path, 0, "arch1", b"archived");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()).purging_cache())
        .unwrap();
    assert!(session.descriptors().get(outcome.handle).unwrap().purge_cache());
    let cached = grid.vault_file("cache1", &path);
    assert!(cached.is_file());

    grid.engine.close(&mut session, outcome.handle).unwrap();
    assert!(!cached.exists());
    let rows = grid.replicas(&path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].resource.name.as_str(), "arch1");
}

#[test]
fn compound_create_syncs_archive_on_close() {
    let grid = Grid::new();
    let path = alice("fresh.dat");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::create(path.clone()).on_resource("pair"))
        .unwrap();
    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert_eq!(descriptor.primary().unwrap().resource.name.as_str(), "cache1");
    let target = descriptor.sync_target().unwrap();
    assert_eq!(target.record.resource.name.as_str(), "arch1");
    assert!(!target.registered);
    assert_eq!(grid.replicas(&path).len(), 1);

    grid.engine.write(&mut session, outcome.handle, b"data").unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let cache_row = grid.replica(&path, 0);
    assert_eq!(cache_row.status, ReplicaStatus::Current);
    assert_eq!(cache_row.size, Some(4));
    let archive_row = grid.replica(&path, 1);
    assert_eq!(archive_row.resource.name.as_str(), "arch1");
    assert_eq!(archive_row.size, Some(4));
    assert_eq!(fs::read(&archive_row.physical_path).unwrap(), b"data");
}

#[test]
fn write_to_archive_copy_goes_through_cache() {
    let grid = Grid::new();
    let path = alice("update.dat");
    grid.seed(&path, 0, "arch1", b"v1");
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::write(path.clone()).truncating())
        .unwrap();
    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert_eq!(descriptor.primary().unwrap().class(), ResourceClass::Cache);
    assert!(descriptor.sync_target().unwrap().registered);

    grid.engine.write(&mut session, outcome.handle, b"v2!").unwrap();
    grid.engine.close(&mut session, outcome.handle).unwrap();

    let archive_row = grid.replica(&path, 0);
    assert_eq!(archive_row.status, ReplicaStatus::Current);
    assert_eq!(archive_row.size, Some(3));
    assert_eq!(fs::read(&archive_row.physical_path).unwrap(), b"v2!");
}

#[test]
fn bundle_read_extracts_collection() {
    let grid = Grid::new();
    let path = alice("coll/m1.txt");
    let member = grid.seed(&path, 0, "bun1", b"first");
    fs::write(member.physical_path.with_file_name("m2.txt"), b"second").unwrap();
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(&mut session, OpenRequest::read(path.clone()))
        .unwrap();
    let primary = session
        .descriptors()
        .get(outcome.handle)
        .unwrap()
        .primary()
        .unwrap()
        .clone();
    assert_eq!(primary.resource.name.as_str(), "cache1");
    assert_eq!(primary.physical_path, grid.root.join("cache/home/alice/coll/m1.txt"));

    let mut buf = [0u8; 8];
    let read = grid
        .engine
        .read_at(&session, outcome.handle, 0, &mut buf)
        .unwrap();
    assert_eq!(&buf[..read], b"first");
    assert!(grid.root.join("cache/home/alice/coll/m2.txt").is_file());
    assert_eq!(grid.replicas(&path).len(), 1);
}

#[test]
fn bundle_write_is_unsupported() {
    let grid = Grid::new();
    let path = alice("coll/m1.txt");
    grid.seed(&path, 0, "bun1", b"first");
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(&mut session, OpenRequest::write(path))
        .unwrap_err();
    assert!(matches!(
        err,
        GridError::ResourceTypeUnsupported {
            class: ResourceClass::Bundle,
            ..
        }
    ));
    assert_eq!(err.code(), -331_000);
}

// ============================================================================
// Remote zones
// ============================================================================

#[test]
fn remote_open_and_close_route_to_zone() {
    let zone = Arc::new(FakeZone::default());
    let grid = Grid::new().with_zone(Arc::clone(&zone) as Arc<dyn ZoneRouter>);
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(lp("/otherZone/home/bob/far.dat")),
        )
        .unwrap();
    assert!(outcome.physically_opened);
    let descriptor = session.descriptors().get(outcome.handle).unwrap();
    assert!(descriptor.is_remote());
    assert_eq!(descriptor.data_size(), Some(12));

    let mut buf = [0u8; 32];
    let read = grid
        .engine
        .read_at(&session, outcome.handle, 7, &mut buf)
        .unwrap();
    assert_eq!(&buf[..read], b"bytes");

    grid.engine.close(&mut session, outcome.handle).unwrap();
    assert_eq!(
        *zone.closed.lock().unwrap(),
        vec![("icat.other.example".to_string(), 9)]
    );
}

#[test]
fn remote_write_routes_to_zone() {
    let zone = Arc::new(FakeZone::default());
    let grid = Grid::new().with_zone(Arc::clone(&zone) as Arc<dyn ZoneRouter>);
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::write(lp("/otherZone/home/bob/far.dat")),
        )
        .unwrap();
    assert_eq!(
        grid.engine
            .write(&mut session, outcome.handle, b"xyz")
            .unwrap(),
        3
    );
    assert_eq!(*zone.written.lock().unwrap(), b"xyz");
    assert_eq!(
        session
            .descriptors()
            .get(outcome.handle)
            .unwrap()
            .bytes_written(),
        3
    );
    grid.engine.close(&mut session, outcome.handle).unwrap();
}

#[test]
fn remote_read_descriptor_refuses_writes() {
    let zone = Arc::new(FakeZone::default());
    let grid = Grid::new().with_zone(Arc::clone(&zone) as Arc<dyn ZoneRouter>);
    let mut session = grid.engine.session("alice");

    let outcome = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(lp("/otherZone/home/bob/far.dat")),
        )
        .unwrap();
    let err = grid
        .engine
        .write(&mut session, outcome.handle, b"xyz")
        .unwrap_err();
    assert!(matches!(err, GridError::PermissionDenied { .. }));
    assert!(zone.written.lock().unwrap().is_empty());
}

#[test]
fn remote_open_is_closed_when_no_slot_is_left() {
    let zone = Arc::new(FakeZone::default());
    let grid = Grid::with_settings(EngineSettings {
        logical_capacity: RESERVED_SLOTS + 1,
        ..EngineSettings::default()
    })
    .with_zone(Arc::clone(&zone) as Arc<dyn ZoneRouter>);
    let path = alice("local.dat");
    grid.seed(&path, 0, "demo", b"abc");
    let mut session = grid.engine.session("alice");
    grid.engine
        .open(&mut session, OpenRequest::read(path))
        .unwrap();

    let err = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(lp("/otherZone/home/bob/far.dat")),
        )
        .unwrap_err();
    assert!(matches!(err, GridError::OutOfDescriptors { .. }));
    assert_eq!(zone.closed.lock().unwrap().len(), 1);
}

#[test]
fn remote_status_passes_through() {
    let zone = Arc::new(FakeZone {
        fail_open: true,
        ..FakeZone::default()
    });
    let grid = Grid::new().with_zone(zone as Arc<dyn ZoneRouter>);
    let mut session = grid.engine.session("alice");

    let err = grid
        .engine
        .open(
            &mut session,
            OpenRequest::read(lp("/otherZone/home/bob/far.dat")),
        )
        .unwrap_err();
    assert_eq!(err.code(), -808_000);
    assert_eq!(session.descriptors().logical_in_use(), 0);
}

// ============================================================================
// Error codes
// ============================================================================

#[test_case(GridError::NoResourceForCreate { path: lp("/z/a") } => -311_000; "no resource")]
#[test_case(GridError::PathTooLong { path: PathBuf::from("/v"), len: 9, max: 8 } => -312_000; "too long")]
#[test_case(GridError::OutOfDescriptors { table: "logical", capacity: 4 } => -340_000; "exhausted")]
#[test_case(GridError::BadDescriptor { table: "logical", index: 2 } => -341_000; "bad descriptor")]
#[test_case(GridError::Remote(RemoteError { host: "h".into(), code: 5, message: String::new() }) => -380_000; "non-negative remote status")]
#[test_case(GridError::RollbackFailed {
    cause: Box::new(GridError::Internal("a".into())),
    rollback: Box::new(GridError::Internal("b".into())),
} => -370_000; "rollback failed")]
fn error_codes(err: GridError) -> i32 {
    err.code()
}

#[test_case(GridError::PathInUse { path: PathBuf::from("/v") } => true; "path in use")]
#[test_case(GridError::ResourceTypeUnsupported { name: "b".into(), class: ResourceClass::Bundle, operation: "write" } => true; "unsupported")]
#[test_case(GridError::QuotaExceeded { requested: 1 } => false; "quota")]
#[test_case(GridError::ObjectNotFound { path: lp("/z/a") } => false; "not found")]
fn resource_state_errors(err: GridError) -> bool {
    err.is_resource_state()
}
