//! Zone routing contract for federated opens.

use vaultgrid_types::LogicalPath;

use crate::open::OpenRequest;

/// Failure reported by (or while reaching) a remote zone.
///
/// `code` is the remote host's own status and is handed to the client as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{host}: {message} (status {code})")]
pub struct RemoteError {
    pub host: String,
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    /// Status for the client. Non-negative codes cannot signal failure, so
    /// they are replaced by a generic remote error status.
    pub fn status(&self) -> i32 {
        if self.code < 0 { self.code } else { -380_000 }
    }
}

/// What a remote zone reports after opening an object on our behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOpenResult {
    /// Descriptor index on the remote host.
    pub remote_index: i32,
    pub size: Option<u64>,
    pub mode: u32,
    pub data_type: String,
    /// Remote physical descriptor index, if the remote opened a file.
    pub physical_index: Option<i32>,
}

/// Decides which zone serves a path and forwards opens to other zones.
pub trait ZoneRouter: Send + Sync {
    fn is_local(&self, path: &LogicalPath) -> bool;

    /// Host of the zone that serves `path`.
    fn host_for(&self, path: &LogicalPath) -> Result<String, RemoteError>;

    fn open_remote(
        &self,
        host: &str,
        request: &OpenRequest,
    ) -> Result<RemoteOpenResult, RemoteError>;

    /// Reads from a descriptor the remote zone handed out.
    fn read_remote(
        &self,
        host: &str,
        remote_index: i32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError>;

    fn write_remote(
        &self,
        host: &str,
        remote_index: i32,
        buf: &[u8],
    ) -> Result<usize, RemoteError>;

    fn close_remote(&self, host: &str, remote_index: i32) -> Result<(), RemoteError>;
}

/// Router for a node that federates with nobody: every path is local.
#[derive(Debug, Clone, Default)]
pub struct LocalZone;

impl ZoneRouter for LocalZone {
    fn is_local(&self, _path: &LogicalPath) -> bool {
        true
    }

    fn host_for(&self, path: &LogicalPath) -> Result<String, RemoteError> {
        Err(RemoteError {
            host: String::new(),
            code: -380_001,
            message: format!("no remote zone serves {path}"),
        })
    }

    fn open_remote(
        &self,
        host: &str,
        _request: &OpenRequest,
    ) -> Result<RemoteOpenResult, RemoteError> {
        Err(unfederated(host))
    }

    fn read_remote(
        &self,
        host: &str,
        _remote_index: i32,
        _offset: u64,
        _buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        Err(unfederated(host))
    }

    fn write_remote(
        &self,
        host: &str,
        _remote_index: i32,
        _buf: &[u8],
    ) -> Result<usize, RemoteError> {
        Err(unfederated(host))
    }

    fn close_remote(&self, host: &str, _remote_index: i32) -> Result<(), RemoteError> {
        Err(unfederated(host))
    }
}

fn unfederated(host: &str) -> RemoteError {
    RemoteError {
        host: host.to_string(),
        code: -380_001,
        message: "federation is not configured".to_string(),
    }
}
