//! Logical and physical descriptor tables.
//!
//! Both tables are fixed-capacity slot arenas owned by one connection:
//!
//! ```text
//!   index   0   1   2 | 3   4   5   ...  capacity-1
//!           reserved  | allocatable
//! ```
//!
//! Every slot carries a generation that is bumped when the slot is freed.
//! Handles record the generation they were issued with, so a handle kept
//! past `free` is rejected with [`GridError::BadDescriptor`] instead of
//! reaching the slot's next occupant. Handles can only be obtained from
//! [`DescriptorTables::allocate`], [`DescriptorTables::allocate_remote`] or
//! [`DescriptorTables::resolve`].

use std::path::PathBuf;

use tracing::{debug, trace};
use vaultgrid_io::FileHandle;
use vaultgrid_types::{ReplicaRecord, ResourceCategory, ResourceClass};

use crate::GridError;
use crate::open::{ChecksumMode, OpenIntent, OpenRequest};
use crate::zone::RemoteOpenResult;

/// Slots at the start of each table that are never handed out.
pub const RESERVED_SLOTS: usize = 3;

const LOGICAL_TABLE: &str = "logical";
const PHYSICAL_TABLE: &str = "physical";

// ============================================================================
// Handles
// ============================================================================

/// Checked reference to an occupied logical descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalHandle {
    index: u32,
    generation: u32,
}

impl LogicalHandle {
    /// The index handed to clients.
    pub fn index(&self) -> i32 {
        self.index as i32
    }
}

impl std::fmt::Display for LogicalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.index)
    }
}

/// Checked reference to an occupied physical descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalHandle {
    index: u32,
    generation: u32,
}

impl PhysicalHandle {
    pub fn index(&self) -> i32 {
        self.index as i32
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Cache copy that must be pushed to its archive when the descriptor closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    /// Archive replica to produce (or refresh).
    pub record: ReplicaRecord,
    /// True if the catalog already has a row for `record`.
    pub registered: bool,
}

/// Open state of a remote zone's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub host: String,
    pub remote_index: i32,
    pub size: Option<u64>,
    pub mode: u32,
    pub data_type: String,
    pub physical_index: Option<i32>,
}

/// Where reads, writes and close for a logical descriptor are routed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PhysicalLink {
    /// Metadata-only open, or not opened yet.
    #[default]
    NotOpened,
    Local(PhysicalHandle),
    Remote(RemoteDescriptor),
}

/// One logical open.
#[derive(Debug, Default)]
pub struct LogicalDescriptor {
    request: Option<OpenRequest>,
    primary: Option<ReplicaRecord>,
    others: Vec<ReplicaRecord>,
    sync_target: Option<SyncTarget>,
    physical: PhysicalLink,
    data_size: Option<u64>,
    bytes_written: u64,
}

impl LogicalDescriptor {
    /// Returns true once `fill` (or a remote allocation) populated the slot.
    pub fn is_filled(&self) -> bool {
        self.request.is_some()
    }

    pub fn request(&self) -> Option<&OpenRequest> {
        self.request.as_ref()
    }

    pub fn intent(&self) -> Option<OpenIntent> {
        self.request.as_ref().map(|r| r.intent)
    }

    pub fn checksum(&self) -> Option<&ChecksumMode> {
        self.request.as_ref().map(|r| &r.checksum)
    }

    pub fn purge_cache(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.purge_cache)
    }

    pub fn primary(&self) -> Option<&ReplicaRecord> {
        self.primary.as_ref()
    }

    /// Replicas not chosen for this open but released with it.
    pub fn others(&self) -> &[ReplicaRecord] {
        &self.others
    }

    pub fn sync_target(&self) -> Option<&SyncTarget> {
        self.sync_target.as_ref()
    }

    pub fn physical(&self) -> &PhysicalLink {
        &self.physical
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.physical, PhysicalLink::Remote(_))
    }

    /// Known size of the open object.
    pub fn data_size(&self) -> Option<u64> {
        self.data_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn set_data_size(&mut self, size: u64) {
        self.data_size = Some(size);
        if let Some(primary) = self.primary.as_mut() {
            primary.size = Some(size);
        }
    }

    pub(crate) fn add_written(&mut self, bytes: u64) {
        self.bytes_written = self.bytes_written.saturating_add(bytes);
    }

    pub(crate) fn into_parts(self) -> DescriptorParts {
        DescriptorParts {
            request: self.request,
            primary: self.primary,
            others: self.others,
            sync_target: self.sync_target,
            physical: self.physical,
            bytes_written: self.bytes_written,
        }
    }
}

/// Owned contents of a freed logical descriptor.
#[derive(Debug)]
pub(crate) struct DescriptorParts {
    pub request: Option<OpenRequest>,
    pub primary: Option<ReplicaRecord>,
    pub others: Vec<ReplicaRecord>,
    pub sync_target: Option<SyncTarget>,
    pub physical: PhysicalLink,
    pub bytes_written: u64,
}

/// Data placed into a freshly allocated logical descriptor.
#[derive(Debug)]
pub struct DescriptorFill {
    pub request: OpenRequest,
    pub primary: ReplicaRecord,
    pub others: Vec<ReplicaRecord>,
    pub sync_target: Option<SyncTarget>,
}

/// One low-level open file.
#[derive(Debug)]
pub struct PhysicalDescriptor {
    pub class: ResourceClass,
    pub category: ResourceCategory,
    pub physical_path: PathBuf,
    pub host: String,
    pub file: Option<FileHandle>,
}

/// What `free` hands back so the caller can finish cleanup.
#[derive(Debug)]
pub struct Released {
    pub descriptor: LogicalDescriptor,
    /// The linked local physical descriptor, already removed from its table.
    pub physical: Option<PhysicalDescriptor>,
}

// ============================================================================
// Slot arena
// ============================================================================

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

#[derive(Debug)]
struct SlotArena<T> {
    table: &'static str,
    slots: Vec<Slot<T>>,
}

impl<T> SlotArena<T> {
    fn new(table: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        Self { table, slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// First free slot at or above the reserved range.
    fn insert(&mut self, entry: T) -> Result<(u32, u32), GridError> {
        let table = self.table;
        let capacity = self.capacity();
        let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .skip(RESERVED_SLOTS)
            .find(|(_, slot)| slot.entry.is_none())
        else {
            return Err(GridError::OutOfDescriptors { table, capacity });
        };
        slot.entry = Some(entry);
        trace!(table, index, generation = slot.generation, "slot allocated");
        Ok((index as u32, slot.generation))
    }

    fn bad(&self, index: u32) -> GridError {
        GridError::BadDescriptor {
            table: self.table,
            index: i64::from(index),
        }
    }

    fn get(&self, index: u32, generation: u32) -> Result<&T, GridError> {
        match self.slots.get(index as usize) {
            Some(Slot {
                generation: current,
                entry: Some(entry),
            }) if *current == generation => Ok(entry),
            _ => Err(self.bad(index)),
        }
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Result<&mut T, GridError> {
        let bad = self.bad(index);
        match self.slots.get_mut(index as usize) {
            Some(Slot {
                generation: current,
                entry: Some(entry),
            }) if *current == generation => Ok(entry),
            _ => Err(bad),
        }
    }

    fn remove(&mut self, index: u32, generation: u32) -> Result<T, GridError> {
        let table = self.table;
        let bad = || GridError::BadDescriptor {
            table,
            index: i64::from(index),
        };
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .ok_or_else(bad)?;
        let entry = slot.entry.take().ok_or_else(bad)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(entry)
    }

    /// Generation of the occupied slot at `raw`.
    fn occupied(&self, raw: i64) -> Result<(u32, u32), GridError> {
        let bad = || GridError::BadDescriptor {
            table: self.table,
            index: raw,
        };
        let index = usize::try_from(raw).map_err(|_| bad())?;
        if index < RESERVED_SLOTS {
            return Err(bad());
        }
        match self.slots.get(index) {
            Some(slot) if slot.entry.is_some() => Ok((index as u32, slot.generation)),
            _ => Err(bad()),
        }
    }
}

// ============================================================================
// Tables
// ============================================================================

/// The logical and physical descriptor tables of one connection.
#[derive(Debug)]
pub struct DescriptorTables {
    logical: SlotArena<LogicalDescriptor>,
    physical: SlotArena<PhysicalDescriptor>,
}

impl DescriptorTables {
    /// Creates tables with the given total sizes, reserved slots included.
    pub fn new(logical_capacity: usize, physical_capacity: usize) -> Self {
        Self {
            logical: SlotArena::new(LOGICAL_TABLE, logical_capacity),
            physical: SlotArena::new(PHYSICAL_TABLE, physical_capacity),
        }
    }

    pub fn logical_capacity(&self) -> usize {
        self.logical.capacity()
    }

    pub fn physical_capacity(&self) -> usize {
        self.physical.capacity()
    }

    pub fn logical_in_use(&self) -> usize {
        self.logical.in_use()
    }

    pub fn physical_in_use(&self) -> usize {
        self.physical.in_use()
    }

    /// Claims an empty logical descriptor.
    pub fn allocate(&mut self) -> Result<LogicalHandle, GridError> {
        let (index, generation) = self.logical.insert(LogicalDescriptor::default())?;
        Ok(LogicalHandle { index, generation })
    }

    /// Populates a descriptor returned by [`Self::allocate`].
    pub fn fill(&mut self, handle: LogicalHandle, fill: DescriptorFill) -> Result<(), GridError> {
        let descriptor = self.logical.get_mut(handle.index, handle.generation)?;
        if descriptor.is_filled() {
            return Err(GridError::Internal(format!(
                "logical descriptor {handle} is already filled"
            )));
        }
        descriptor.data_size = fill.request.data_size.or(fill.primary.size);
        descriptor.request = Some(fill.request);
        descriptor.primary = Some(fill.primary);
        descriptor.others = fill.others;
        descriptor.sync_target = fill.sync_target;
        Ok(())
    }

    /// Synthesizes a descriptor for an object opened by a remote zone.
    pub fn allocate_remote(
        &mut self,
        request: OpenRequest,
        host: String,
        result: RemoteOpenResult,
    ) -> Result<LogicalHandle, GridError> {
        let descriptor = LogicalDescriptor {
            data_size: result.size,
            request: Some(request),
            physical: PhysicalLink::Remote(RemoteDescriptor {
                host,
                remote_index: result.remote_index,
                size: result.size,
                mode: result.mode,
                data_type: result.data_type,
                physical_index: result.physical_index,
            }),
            ..LogicalDescriptor::default()
        };
        let (index, generation) = self.logical.insert(descriptor)?;
        Ok(LogicalHandle { index, generation })
    }

    pub fn get(&self, handle: LogicalHandle) -> Result<&LogicalDescriptor, GridError> {
        self.logical.get(handle.index, handle.generation)
    }

    pub fn get_mut(&mut self, handle: LogicalHandle) -> Result<&mut LogicalDescriptor, GridError> {
        self.logical.get_mut(handle.index, handle.generation)
    }

    /// Turns a client-supplied index back into a handle.
    pub fn resolve(&self, index: i32) -> Result<LogicalHandle, GridError> {
        let (index, generation) = self.logical.occupied(i64::from(index))?;
        Ok(LogicalHandle { index, generation })
    }

    /// Places `physical` in the physical table and links it to `handle`.
    pub fn open_physical(
        &mut self,
        handle: LogicalHandle,
        physical: PhysicalDescriptor,
    ) -> Result<PhysicalHandle, GridError> {
        if !matches!(self.get(handle)?.physical, PhysicalLink::NotOpened) {
            return Err(GridError::Internal(format!(
                "logical descriptor {handle} is already physically open"
            )));
        }
        let (index, generation) = self.physical.insert(physical)?;
        let linked = PhysicalHandle { index, generation };
        self.get_mut(handle)?.physical = PhysicalLink::Local(linked);
        debug!(logical = handle.index, physical = index, "linked physical descriptor");
        Ok(linked)
    }

    pub fn physical(&self, handle: PhysicalHandle) -> Result<&PhysicalDescriptor, GridError> {
        self.physical.get(handle.index, handle.generation)
    }

    pub fn physical_mut(
        &mut self,
        handle: PhysicalHandle,
    ) -> Result<&mut PhysicalDescriptor, GridError> {
        self.physical.get_mut(handle.index, handle.generation)
    }

    /// Empties the slot of `handle` and of its linked physical descriptor.
    ///
    /// The handle (and every copy of it) is invalid afterwards.
    pub fn free(&mut self, handle: LogicalHandle) -> Result<Released, GridError> {
        let descriptor = self.logical.remove(handle.index, handle.generation)?;
        let physical = match descriptor.physical {
            PhysicalLink::Local(linked) => {
                self.physical.remove(linked.index, linked.generation).ok()
            }
            _ => None,
        };
        debug!(logical = handle.index, "freed logical descriptor");
        Ok(Released {
            descriptor,
            physical,
        })
    }
}
