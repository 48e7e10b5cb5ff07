//! File driver for vaults on the local host, using `std::fs`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::IoError;
use crate::driver::{FileDriver, FileHandle, FileStat, OpenFlags};

/// File driver bound to one host name.
///
/// Requests naming any other host fail with [`IoError::UnknownHost`].
#[derive(Debug)]
pub struct LocalDriver {
    host: String,
    /// Counter for generating unique file handle IDs.
    next_handle_id: AtomicU64,
}

impl LocalDriver {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            next_handle_id: AtomicU64::new(1),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn next_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_host(&self, host: &str) -> Result<(), IoError> {
        if host == self.host {
            Ok(())
        } else {
            Err(IoError::UnknownHost {
                host: host.to_string(),
            })
        }
    }

    fn ensure_parent(path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IoError::at(parent, e))?;
        }
        Ok(())
    }
}

impl FileDriver for LocalDriver {
    fn open(&self, path: &Path, flags: OpenFlags, host: &str) -> Result<FileHandle, IoError> {
        self.check_host(host)?;
        let mut opts = OpenOptions::new();
        opts.read(flags.read)
            .write(flags.write || flags.truncate)
            .create(flags.create)
            .truncate(flags.truncate);

        let file = opts.open(path).map_err(|e| IoError::at(path, e))?;
        let id = self.next_id();
        debug!(path = %path.display(), handle = id, "opened file");
        Ok(FileHandle::from_file(id, path.to_path_buf(), file))
    }

    fn create(&self, path: &Path, host: &str) -> Result<FileHandle, IoError> {
        self.check_host(host)?;
        Self::ensure_parent(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| IoError::at(path, e))?;
        let id = self.next_id();
        debug!(path = %path.display(), handle = id, "created file");
        Ok(FileHandle::from_file(id, path.to_path_buf(), file))
    }

    fn rename(&self, from: &Path, to: &Path, host: &str) -> Result<(), IoError> {
        self.check_host(host)?;
        if to.exists() {
            return Err(IoError::AlreadyExists {
                path: to.to_path_buf(),
            });
        }
        Self::ensure_parent(to)?;
        fs::rename(from, to).map_err(|e| IoError::at(from, e))?;
        debug!(from = %from.display(), to = %to.display(), "renamed file");
        Ok(())
    }

    fn stat(&self, path: &Path, host: &str) -> Result<FileStat, IoError> {
        self.check_host(host)?;
        let metadata = fs::metadata(path).map_err(|e| IoError::at(path, e))?;
        Ok(FileStat {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    fn unlink(&self, path: &Path, host: &str) -> Result<(), IoError> {
        self.check_host(host)?;
        fs::remove_file(path).map_err(|e| IoError::at(path, e))
    }

    fn write(&self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize, IoError> {
        let file = handle.file_mut()?;
        let n = file.write(buf)?;
        Ok(n)
    }

    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let n = handle.file()?.read_at(buf, offset)?;
            Ok(n)
        }

        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt;
            let n = handle.file()?.seek_read(buf, offset)?;
            Ok(n)
        }
    }

    fn truncate(&self, handle: &mut FileHandle, len: u64) -> Result<(), IoError> {
        handle.file_mut()?.set_len(len)?;
        debug!(path = %handle.path().display(), len, "truncated file");
        Ok(())
    }

    fn close(&self, mut handle: FileHandle) -> Result<(), IoError> {
        if handle.file.take().is_none() {
            return Err(IoError::InvalidHandle { handle: handle.id });
        }
        Ok(())
    }
}
