//! Snapshot codecs
//!
//! A codec turns a source into snapshot blobs and blobs back into a tree.
//! The chain engine treats it as a black box with four operations: probe the
//! source, create a full or incremental blob, apply a blob to a directory and
//! inspect a reconstructed tree. Consolidation additionally snapshots trees
//! replayed from a chain through [`SnapshotCodec::create_replayed`]. One
//! implementation exists per [`TargetKind`], selected by [`for_target`].
//!
//! | Kind | Marker | Blob |
//! |---|---|---|
//! | directory | SHA-256 over the sorted entry index | lz4 frame stream of bincode records (`.snap`) |
//! | repository | `HEAD` commit id | git bundle (`.bundle`) |

use std::path::Path;
use std::sync::Arc;

use crate::config::{CodecConfig, TargetConfig};
use crate::error::Result;
use crate::manifest::{Artifact, ManifestStore};
use crate::types::{ArtifactStats, SourceProbe, TargetKind};

mod directory;
mod repository;

pub use directory::DirectoryCodec;
pub use repository::RepositoryCodec;

/// What to snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode<'a> {
    /// Everything, independent of prior artifacts
    Full,
    /// Changes since the given marker
    Incremental {
        /// Marker recorded as the previous artifact's `range_end`
        since: &'a str,
    },
}

/// Description of a freshly written blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Marker of the source state the blob reconstructs
    pub range_end: String,
    /// Shape of the source at `range_end`
    pub stats: ArtifactStats,
}

/// Result of inspecting a reconstructed tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Number of checks performed
    pub checks: usize,
    /// Description of every failed check
    pub failures: Vec<String>,
}

impl Inspection {
    /// Record a check; `failure` is kept when the check did not pass
    pub fn check(&mut self, passed: bool, failure: impl FnOnce() -> String) {
        self.checks += 1;
        if !passed {
            self.failures.push(failure());
        }
    }

    /// Whether every check passed
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line summary for logs and reports
    pub fn summary(&self) -> String {
        if self.is_ok() {
            format!("{} checks passed", self.checks)
        } else {
            format!(
                "{} of {} checks failed: {}",
                self.failures.len(),
                self.checks,
                self.failures.join("; ")
            )
        }
    }
}

/// Black-box snapshot producer and consumer for one target kind
pub trait SnapshotCodec: Send + Sync {
    /// Kind of target this codec handles
    fn target_kind(&self) -> TargetKind;

    /// File extension of produced blobs
    fn extension(&self) -> &'static str;

    /// Current marker and size of the source
    fn probe(&self, source: &Path) -> Result<SourceProbe>;

    /// Write a blob for `source` to `out`
    ///
    /// An incremental whose base state is no longer available fails with
    /// [`crate::ChainError::BaseStateMissing`].
    fn create(&self, source: &Path, mode: SnapshotMode<'_>, out: &Path) -> Result<SnapshotInfo>;

    /// Write a full blob of a tree rebuilt by applying a chain
    ///
    /// Source filters such as directory excludes are not applied, so the
    /// result reconstructs exactly what the chain did.
    fn create_replayed(&self, tree: &Path, out: &Path) -> Result<SnapshotInfo> {
        self.create(tree, SnapshotMode::Full, out)
    }

    /// Apply a blob to `target`
    ///
    /// A full blob expects an empty or missing `target`; an incremental blob
    /// expects `target` to hold the state its base marker describes.
    fn apply(&self, blob: &Path, target: &Path) -> Result<()>;

    /// Check a reconstructed tree against what `expected` claims it holds
    fn inspect(&self, target: &Path, expected: &Artifact) -> Result<Inspection>;
}

/// Build the codec for a target
///
/// The directory codec keeps its scan indexes in the target's codec state
/// directory inside `store`.
pub fn for_target(
    target: &TargetConfig,
    config: &CodecConfig,
    store: &ManifestStore,
) -> Result<Arc<dyn SnapshotCodec>> {
    for_kind(target.kind(), target, config, store)
}

/// Build the codec for an explicit kind
pub fn for_kind(
    kind: TargetKind,
    target: &TargetConfig,
    config: &CodecConfig,
    store: &ManifestStore,
) -> Result<Arc<dyn SnapshotCodec>> {
    Ok(match kind {
        TargetKind::Directory => Arc::new(DirectoryCodec::new(
            store.codec_dir(&target.name),
            &target.exclude,
            config.spot_checks,
        )?),
        TargetKind::Repository => Arc::new(RepositoryCodec::new(config.git_binary.clone(), config.timeout)),
    })
}
