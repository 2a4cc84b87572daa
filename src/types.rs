//! Core data types shared across the chain engine
//!
//! This module holds the closed enums that replace string-tagged dispatch
//! (`TargetKind`, `ArtifactKind`) and the result records returned by sync,
//! restore and listing operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::manifest::Artifact;

/// Kind of backup target
///
/// Determines which snapshot codec handles the target and what a marker
/// means: a revision for repositories, a scan digest for directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Version-controlled repository with revision history
    Repository,
    /// Plain directory tree without history
    Directory,
}

impl TargetKind {
    /// Guess the kind of a source path: anything with a `.git` entry is a repository
    pub fn detect(path: &Path) -> Self {
        if path.join(".git").exists() {
            TargetKind::Repository
        } else {
            TargetKind::Directory
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Repository => write!(f, "repository"),
            TargetKind::Directory => write!(f, "directory"),
        }
    }
}

/// Kind of artifact in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Self-contained snapshot; always the first link of a chain
    Full,
    /// Delta on top of the previous artifact's `range_end`
    Incremental,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Full => write!(f, "full"),
            ArtifactKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// Hash of one file recorded at snapshot time, re-checked after restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotCheck {
    /// Path relative to the target root, `/`-separated
    pub path: String,
    /// SHA-256 of the file content
    pub checksum: String,
}

/// Shape of the source tree at an artifact's `range_end`
///
/// Restore verification compares the reconstructed tree against these
/// numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStats {
    /// Number of regular files (and symlinks) in the tree
    #[serde(default)]
    pub file_count: u64,
    /// Sum of regular file sizes
    #[serde(default)]
    pub total_bytes: u64,
    /// Number of revisions reachable from the exported refs (repositories only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_count: Option<u64>,
    /// Sampled file hashes (directories only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spot_checks: Vec<SpotCheck>,
}

/// Live state of a source as seen by its codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProbe {
    /// Current marker (revision or scan digest)
    pub marker: String,
    /// Current size in bytes
    pub size_bytes: u64,
}

/// What a sync call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Source unchanged since the last artifact; nothing produced
    NoOp,
    /// A full artifact was produced and the chain reset to it
    Full,
    /// An incremental artifact was appended
    Incremental,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::NoOp => write!(f, "no-op"),
            SyncAction::Full => write!(f, "full"),
            SyncAction::Incremental => write!(f, "incremental"),
        }
    }
}

/// Result of one successful sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Target name
    pub target: String,
    /// Action taken
    pub action: SyncAction,
    /// Whether a consolidation ran before the artifact was produced
    pub consolidated: bool,
    /// Artifact produced, if any
    pub artifact: Option<Artifact>,
    /// Chain length after the sync
    pub chain_length: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Final verdict of a restore or verify run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Chain fetched, applied and structurally verified
    Verified,
    /// A fetched blob did not match its recorded checksum
    ChecksumMismatch {
        /// Position in the chain
        position: usize,
        /// Artifact file name
        filename: String,
        /// Recorded checksum
        expected: String,
        /// Computed checksum
        actual: String,
    },
    /// Reconstructed target failed its domain checks
    StructuralFailure {
        /// Description of the first failed check
        reason: String,
    },
    /// An artifact referenced by the manifest is missing or out of sequence
    IncompleteChain {
        /// Position of the first missing artifact
        position: usize,
        /// Artifact file name
        filename: String,
    },
}

impl RestoreStatus {
    /// Whether the restore produced a verified result
    pub fn is_verified(&self) -> bool {
        matches!(self, RestoreStatus::Verified)
    }

    /// Process exit code for this status
    pub fn exit_code(&self) -> i32 {
        match self {
            RestoreStatus::Verified => 0,
            RestoreStatus::ChecksumMismatch { .. } => 3,
            RestoreStatus::StructuralFailure { .. } => 4,
            RestoreStatus::IncompleteChain { .. } => 5,
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStatus::Verified => write!(f, "Verified"),
            RestoreStatus::ChecksumMismatch { position, filename, .. } => {
                write!(f, "ChecksumMismatch at #{} ({})", position, filename)
            }
            RestoreStatus::StructuralFailure { reason } => write!(f, "StructuralFailure: {}", reason),
            RestoreStatus::IncompleteChain { position, filename } => {
                write!(f, "IncompleteChain at #{} ({})", position, filename)
            }
        }
    }
}

/// Result of a restore or verify run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Target name
    pub target: String,
    /// Where the chain was applied
    pub destination: PathBuf,
    /// Final verdict
    pub status: RestoreStatus,
    /// Number of artifacts applied
    pub artifacts_applied: usize,
    /// Bytes fetched from the remote
    pub bytes_fetched: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// One line of `list` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    /// Target name
    pub name: String,
    /// Kind of the target
    pub kind: TargetKind,
    /// Chain length, `None` if never synced
    pub chain_length: Option<usize>,
    /// Incrementals since the last full artifact
    pub incremental_count: Option<u64>,
    /// Creation time of the newest artifact
    pub last_sync: Option<DateTime<Utc>>,
    /// Number of consolidations performed so far
    pub consolidations: usize,
}
