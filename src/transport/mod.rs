//! Blob transport: the remote key-value store that holds chains
//!
//! The engine only needs put/get/list/delete/exists on named blobs under a
//! remote prefix. Backends must report transient failures (network, timeouts,
//! throttling) distinctly from permanent ones so that [`RetryingTransport`]
//! can retry the former and surface the latter immediately.
//!
//! ## Remote layout
//!
//! ```text
//! <target>/manifest.json              committed manifest
//! <target>/chain/<filename>           live artifacts
//! <target>/archive/<stamp>/<filename> artifacts superseded by a consolidation
//! ```

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{RemoteBackend, RemoteConfig};

mod local;
mod memory;
mod rclone;
mod retry;

pub use local::LocalTransport;
pub use memory::{MemoryTransport, Operation as TransportOperation};
pub use rclone::RcloneTransport;
pub use retry::RetryingTransport;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Classified transport failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The named blob does not exist
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Temporary failure; the same call may succeed later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TransportError {
    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Whether the failure means the blob is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }

    /// Classify an I/O error for a given key
    pub fn from_io(key: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => TransportError::NotFound(key.to_string()),
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => TransportError::Transient(format!("{key}: {err}")),
            _ => TransportError::Permanent(format!("{key}: {err}")),
        }
    }
}

/// Named-blob store holding target chains
///
/// Keys are `/`-separated and relative to the configured remote root.
/// Implementations must be safe to share across the per-target worker
/// threads used by `sync --all`.
pub trait BlobTransport: Send + Sync {
    /// Upload a local file to `remote`, replacing any existing blob
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()>;

    /// Download `remote` into the local file `local`
    fn get(&self, remote: &str, local: &Path) -> TransportResult<()>;

    /// List the full keys of every blob under `prefix`
    fn list(&self, prefix: &str) -> TransportResult<Vec<String>>;

    /// Delete `remote`; deleting an absent blob succeeds
    fn delete(&self, remote: &str) -> TransportResult<()>;

    /// Check whether `remote` exists
    fn exists(&self, remote: &str) -> TransportResult<bool>;
}

impl<T: BlobTransport + ?Sized> BlobTransport for Arc<T> {
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()> {
        (**self).put(remote, local)
    }

    fn get(&self, remote: &str, local: &Path) -> TransportResult<()> {
        (**self).get(remote, local)
    }

    fn list(&self, prefix: &str) -> TransportResult<Vec<String>> {
        (**self).list(prefix)
    }

    fn delete(&self, remote: &str) -> TransportResult<()> {
        (**self).delete(remote)
    }

    fn exists(&self, remote: &str) -> TransportResult<bool> {
        (**self).exists(remote)
    }
}

/// Key of a target's committed manifest
pub fn manifest_key(target: &str) -> String {
    format!("{target}/manifest.json")
}

/// Prefix holding a target's live artifacts
pub fn chain_prefix(target: &str) -> String {
    format!("{target}/chain/")
}

/// Key of a live artifact
pub fn chain_key(target: &str, filename: &str) -> String {
    format!("{target}/chain/{filename}")
}

/// Prefix an archive batch is written under
pub fn archive_prefix(target: &str, stamp: &str) -> String {
    format!("{target}/archive/{stamp}/")
}

/// Build the transport described by the configuration, wrapped in the
/// configured retry policy
pub fn transport_from_config(config: &RemoteConfig) -> crate::Result<Arc<dyn BlobTransport>> {
    let inner: Box<dyn BlobTransport> = match &config.backend {
        RemoteBackend::Local { path } => Box::new(LocalTransport::new(path)?),
        RemoteBackend::Rclone { remote, binary } => Box::new(RcloneTransport::new(
            remote.clone(),
            binary.clone(),
            config.timeout,
        )),
    };
    Ok(Arc::new(RetryingTransport::new(inner, config.retry.clone())))
}
