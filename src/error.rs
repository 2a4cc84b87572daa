//! Error types for chainback
//!
//! All chain operations return [`Result<T>`]. The variants follow the failure
//! taxonomy operators care about: transient transport problems are retried,
//! codec failures and checksum mismatches are fatal for the current operation,
//! and an incomplete chain is reported with the position of the first missing
//! artifact.

use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

/// Type alias for Results in chainback
pub type Result<T> = std::result::Result<T, ChainError>;

/// Main error type for all chain operations
#[derive(Debug, Error)]
pub enum ChainError {
    /// I/O errors during local file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Configuration file could not be parsed or is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Target name is not present in the configuration
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// No manifest exists for the target (locally or remotely)
    #[error("No manifest found for target {0}")]
    ManifestNotFound(String),

    /// Manifest violates a chain invariant
    #[error("Invalid manifest for {target}: {reason}")]
    InvalidManifest {
        /// Target whose manifest is broken
        target: String,
        /// First invariant violation found
        reason: String,
    },

    /// Snapshot creation or application failed
    #[error("Codec failure on {path:?}: {message}")]
    Codec {
        /// Source or destination path involved
        path: PathBuf,
        /// Underlying cause
        message: String,
    },

    /// An incremental snapshot was requested but the codec no longer has the
    /// state recorded at the base marker
    #[error("Codec state for marker {0} is missing")]
    BaseStateMissing(String),

    /// External command exceeded its time budget
    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout {
        /// Command line that was running
        command: String,
        /// Budget in seconds
        seconds: u64,
    },

    /// Blob transport failure (after retries for transient failures)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Fetched blob does not match the checksum recorded in the manifest
    #[error("Checksum mismatch for {filename} - expected: {expected}, actual: {actual}")]
    ChecksumMismatch {
        /// Artifact file name
        filename: String,
        /// Recorded checksum
        expected: String,
        /// Computed checksum
        actual: String,
    },

    /// A referenced artifact is missing from the chain
    #[error("Incomplete chain: artifact #{position} ({filename}) is missing")]
    IncompleteChain {
        /// Zero-based position of the first missing artifact
        position: usize,
        /// Artifact file name
        filename: String,
    },

    /// Consolidation aborted; the previous chain is left untouched
    #[error("Consolidation failed for {target}: {reason}")]
    ConsolidationFailed {
        /// Target being consolidated
        target: String,
        /// Why the new full artifact was rejected
        reason: String,
    },

    /// Restore cannot proceed
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Another process holds the target lock
    #[error("Target {0} is locked by another process")]
    TargetLocked(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for ChainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ChainError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ChainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ChainError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for ChainError {
    fn from(err: globset::Error) -> Self {
        ChainError::InvalidPattern(err.to_string())
    }
}

impl ChainError {
    /// Create a codec error for a path
    pub fn codec(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        ChainError::Codec {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        ChainError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ChainError::Internal(msg.into())
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Transport(e) => e.is_transient(),
            ChainError::Timeout { .. } | ChainError::TargetLocked(_) => true,
            _ => false,
        }
    }

    /// Check if this error indicates bad data rather than a bad transfer or
    /// environment
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidManifest { .. }
                | ChainError::IncompleteChain { .. }
                | ChainError::Bincode(_)
        )
    }

    /// Process exit code for a command that failed with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ChainError::ChecksumMismatch { .. } => 3,
            ChainError::IncompleteChain { .. } => 5,
            _ => 1,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ChainError::UnknownTarget(name) => {
                format!("Target '{}' is not configured. Use 'chainback list' to see configured targets.", name)
            }
            ChainError::TargetLocked(name) => {
                format!("Target '{}' is busy: another sync, consolidation or restore holds its lock. Try again later.", name)
            }
            ChainError::ManifestNotFound(name) => {
                format!("Target '{}' has never been synced. Run 'chainback sync {}' first.", name, name)
            }
            _ => self.to_string(),
        }
    }
}
