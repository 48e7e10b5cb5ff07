//! I/O error types.

use std::path::PathBuf;

/// Errors from a file driver.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// File not found.
    #[error("file not found: {path}")]
    NotFound { path: PathBuf },

    /// Target of a create or rename already exists.
    #[error("file already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// Invalid file handle.
    #[error("invalid file handle: {handle}")]
    InvalidHandle { handle: u64 },

    /// The driver does not serve the requested host.
    #[error("host {host} is not served by this driver")]
    UnknownHost { host: String },
}

impl IoError {
    /// Classifies an OS error against the path it concerns.
    pub(crate) fn at(path: &std::path::Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists {
                path: path.to_path_buf(),
            },
            _ => Self::Io { source },
        }
    }
}
