//! File driver trait.
//!
//! The [`FileDriver`] trait abstracts the per-resource file primitives used by
//! the replica engine: open, create, rename, stat and unlink. Every call names
//! the host that owns the file so a driver can refuse (or route) requests for
//! storage it does not serve.
//!
//! All methods are synchronous and block until the underlying storage
//! returns.

use std::path::{Path, PathBuf};

use crate::IoError;

/// Flags for opening files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it doesn't exist.
    pub create: bool,
    /// Truncate an existing file to zero length.
    pub truncate: bool,
}

impl OpenFlags {
    /// Flags for reading an existing file.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for writing an existing file in place.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Adds the truncate flag.
    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// Metadata returned by [`FileDriver::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// Opaque handle to an open file.
///
/// The handle must be closed via [`FileDriver::close`].
#[derive(Debug)]
pub struct FileHandle {
    /// Driver-assigned identifier.
    pub(crate) id: u64,
    /// Physical path the handle was opened on.
    pub(crate) path: PathBuf,
    /// The open file (for the local driver).
    pub(crate) file: Option<std::fs::File>,
}

impl FileHandle {
    /// Creates a new file handle wrapping a `std::fs::File`.
    pub(crate) fn from_file(id: u64, path: PathBuf, file: std::fs::File) -> Self {
        Self {
            id,
            path,
            file: Some(file),
        }
    }

    /// Creates a handle for drivers that track open files themselves.
    pub fn detached(id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            file: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the internal file reference mutably.
    pub(crate) fn file_mut(&mut self) -> Result<&mut std::fs::File, IoError> {
        self.file
            .as_mut()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }

    /// Returns the internal file reference.
    pub(crate) fn file(&self) -> Result<&std::fs::File, IoError> {
        self.file
            .as_ref()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }
}

/// Abstraction over the file primitives of one resource category.
pub trait FileDriver: Send + Sync {
    /// Opens an existing file with the given flags.
    fn open(&self, path: &Path, flags: OpenFlags, host: &str) -> Result<FileHandle, IoError>;

    /// Creates a new, empty file for writing, creating parent directories.
    ///
    /// Fails with [`IoError::AlreadyExists`] if the path is occupied.
    fn create(&self, path: &Path, host: &str) -> Result<FileHandle, IoError>;

    /// Renames a file, creating the parent directories of `to`.
    fn rename(&self, from: &Path, to: &Path, host: &str) -> Result<(), IoError>;

    /// Returns size and kind of the file at `path`.
    fn stat(&self, path: &Path, host: &str) -> Result<FileStat, IoError>;

    /// Removes a file.
    fn unlink(&self, path: &Path, host: &str) -> Result<(), IoError>;

    /// Writes at the current position, returning the number of bytes written.
    fn write(&self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize, IoError>;

    /// Reads data from a file at the given byte offset.
    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Cuts or extends an open file to `len` bytes.
    fn truncate(&self, handle: &mut FileHandle, len: u64) -> Result<(), IoError>;

    /// Closes a file handle.
    fn close(&self, handle: FileHandle) -> Result<(), IoError>;
}
