//! # vaultgrid-types: Core types for `VaultGrid`
//!
//! This crate contains the data model shared by every VaultGrid crate:
//! - Names and numbers ([`ResourceName`], [`ReplicaNumber`])
//! - Logical namespace paths ([`LogicalPath`])
//! - Resource description ([`ResourceClass`], [`ResourceCategory`], [`ResourceIdentity`])
//! - Vault naming ([`VaultScheme`])
//! - Replica rows ([`ReplicaRecord`], [`ReplicaStatus`])
//! - Temporal types ([`Timestamp`])

use std::{
    fmt::{Debug, Display},
    path::PathBuf,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while parsing VaultGrid values from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// Logical path is empty or does not start at the namespace root.
    #[error("logical path must be absolute: {path:?}")]
    NotAbsolute { path: String },

    /// Logical path contains an empty, `.` or `..` segment.
    #[error("logical path has an invalid segment: {path:?}")]
    InvalidSegment { path: String },

    /// Text does not name a known variant.
    #[error("unknown {kind}: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

// ============================================================================
// Names and numbers
// ============================================================================

/// Name of a storage resource or of a resource group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-object replica number. Unique among the replicas of one logical path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ReplicaNumber(u32);

impl ReplicaNumber {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the next replica number.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for ReplicaNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ReplicaNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ReplicaNumber> for u32 {
    fn from(number: ReplicaNumber) -> Self {
        number.0
    }
}

// ============================================================================
// Logical paths
// ============================================================================

/// An absolute path in the logical namespace, e.g. `/tempZone/home/alice/a.dat`.
///
/// The first segment names the zone that owns the path. Paths never carry a
/// trailing slash and never contain empty, `.` or `..` segments, so they can
/// be grafted onto a vault root without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn new(path: impl Into<String>) -> Result<Self, TypeError> {
        let path = path.into();
        let Some(rest) = path.strip_prefix('/') else {
            return Err(TypeError::NotAbsolute { path });
        };
        if rest.is_empty() {
            return Err(TypeError::NotAbsolute { path });
        }
        if rest
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(TypeError::InvalidSegment { path });
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, without the leading root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// The zone that owns this path.
    pub fn zone(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    /// Final segment of the path.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// The enclosing collection, or `None` for a zone root.
    pub fn parent(&self) -> Option<LogicalPath> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            return None;
        }
        Some(Self(self.0[..idx].to_string()))
    }

    /// Returns true if the path sits in the zone-level hierarchy named
    /// `segment` (for example `/tempZone/trash/...`).
    pub fn is_under(&self, segment: &str) -> bool {
        self.segments().nth(1) == Some(segment)
    }

    /// Appends one segment.
    pub fn join(&self, name: &str) -> Result<Self, TypeError> {
        Self::new(format!("{}/{name}", self.0))
    }
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogicalPath> for String {
    fn from(path: LogicalPath) -> Self {
        path.0
    }
}

impl FromStr for LogicalPath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Behavioral class of a resource.
///
/// The class drives the open decision tree: normal and cache resources are
/// opened directly, archive (compound) and bundle resources must be staged
/// into a cache-resident copy first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    Normal,
    Cache,
    Archive,
    Bundle,
}

impl ResourceClass {
    /// Returns true if data on this class cannot be opened in place.
    pub fn requires_staging(self) -> bool {
        matches!(self, Self::Archive | Self::Bundle)
    }

    /// Ordering rank used when choosing a replica to read from.
    ///
    /// Cache copies are cheapest, archive and bundle copies need staging.
    pub fn read_rank(self) -> u8 {
        match self {
            Self::Cache => 0,
            Self::Normal => 1,
            Self::Archive => 2,
            Self::Bundle => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Cache => "cache",
            Self::Archive => "archive",
            Self::Bundle => "bundle",
        }
    }
}

impl Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "cache" => Ok(Self::Cache),
            "archive" | "compound" => Ok(Self::Archive),
            "bundle" => Ok(Self::Bundle),
            other => Err(TypeError::UnknownVariant {
                kind: "resource class",
                value: other.to_string(),
            }),
        }
    }
}

/// Storage category of a resource, selecting the file driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceCategory {
    /// Plain files addressed by path.
    FileSystem,
    /// Structured or archive-backed storage.
    Structured,
}

impl ResourceCategory {
    /// The category a resource of `class` has unless configured otherwise.
    pub fn default_for(class: ResourceClass) -> Self {
        match class {
            ResourceClass::Normal | ResourceClass::Cache => Self::FileSystem,
            ResourceClass::Archive | ResourceClass::Bundle => Self::Structured,
        }
    }
}

impl Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileSystem => f.write_str("file-system"),
            Self::Structured => f.write_str("structured"),
        }
    }
}

/// Everything the engine needs to know about one storage resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub name: ResourceName,
    /// Resource group this resource belongs to. Compound cache/archive pairs
    /// share a group.
    #[serde(default)]
    pub group: Option<ResourceName>,
    pub host: String,
    pub category: ResourceCategory,
    pub class: ResourceClass,
    /// Storage root under which replicas of this resource live.
    pub vault_path: PathBuf,
}

impl ResourceIdentity {
    pub fn new(
        name: impl Into<ResourceName>,
        host: impl Into<String>,
        class: ResourceClass,
        vault_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            group: None,
            host: host.into(),
            category: ResourceCategory::default_for(class),
            class,
            vault_path: vault_path.into(),
        }
    }

    pub fn with_group(mut self, group: impl Into<ResourceName>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_category(mut self, category: ResourceCategory) -> Self {
        self.category = category;
        self
    }

    /// Returns true if this resource is `name` or belongs to group `name`.
    pub fn answers_to(&self, name: &ResourceName) -> bool {
        &self.name == name || self.group.as_ref() == Some(name)
    }

    /// Returns true if both resources share a resource group.
    pub fn same_group(&self, other: &ResourceIdentity) -> bool {
        matches!((&self.group, &other.group), (Some(a), Some(b)) if a == b)
    }
}

/// Naming scheme used to derive the vault path of a new replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaultScheme {
    /// Deterministic: the logical path grafted onto the vault root.
    #[default]
    Graft,
    /// Hashed directories plus a timestamp suffix.
    Random,
}

impl Display for VaultScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graft => f.write_str("graft"),
            Self::Random => f.write_str("random"),
        }
    }
}

impl FromStr for VaultScheme {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "graft" => Ok(Self::Graft),
            "random" => Ok(Self::Random),
            other => Err(TypeError::UnknownVariant {
                kind: "vault scheme",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Replicas
// ============================================================================

/// Replica status as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaStatus {
    /// Up-to-date copy.
    #[default]
    Current,
    /// Created by an open that has not completed yet.
    NewlyCreated,
    /// Superseded by a newer write to another replica.
    OldCopy,
    /// Marked unusable after a failed write or sync.
    Stale,
}

impl ReplicaStatus {
    /// Returns true for copies that must not be served to readers.
    pub fn is_superseded(self) -> bool {
        matches!(self, Self::OldCopy | Self::Stale)
    }
}

impl Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::NewlyCreated => f.write_str("newly-created"),
            Self::OldCopy => f.write_str("old-copy"),
            Self::Stale => f.write_str("stale"),
        }
    }
}

impl FromStr for ReplicaStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "newly-created" => Ok(Self::NewlyCreated),
            "old-copy" => Ok(Self::OldCopy),
            "stale" => Ok(Self::Stale),
            other => Err(TypeError::UnknownVariant {
                kind: "replica status",
                value: other.to_string(),
            }),
        }
    }
}

/// One physical copy of one logical object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub logical_path: LogicalPath,
    pub replica_number: ReplicaNumber,
    pub resource: ResourceIdentity,
    pub physical_path: PathBuf,
    /// Size in bytes, `None` when unknown.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub status: ReplicaStatus,
    #[serde(default)]
    pub modified: Timestamp,
}

impl ReplicaRecord {
    pub fn new(
        logical_path: LogicalPath,
        replica_number: ReplicaNumber,
        resource: ResourceIdentity,
        physical_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            logical_path,
            replica_number,
            resource,
            physical_path: physical_path.into(),
            size: None,
            checksum: None,
            status: ReplicaStatus::Current,
            modified: Timestamp::EPOCH,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_status(mut self, status: ReplicaStatus) -> Self {
        self.status = status;
        self
    }

    /// Resource class of the resource holding this copy.
    pub fn class(&self) -> ResourceClass {
        self.resource.class
    }
}

// ============================================================================
// Timestamp - Copy (8-byte nanosecond value)
// ============================================================================

/// Wall-clock timestamp with nanosecond precision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp as seconds since Unix epoch (truncates nanoseconds).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Creates a timestamp for the current time.
    ///
    /// A clock set before the Unix epoch reads as [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as u64)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}
