//! Manifest model and the local manifest store
//!
//! A manifest is the durable record of one target's chain: which artifacts
//! exist, in which order, which marker the next incremental starts from, and
//! every consolidation performed so far. It is stored as pretty JSON both in
//! the local state directory and next to the chain on the remote.
//!
//! ## Chain invariants
//!
//! - a non-empty chain starts with a full artifact
//! - every later artifact is incremental and starts where its predecessor ends
//! - `incremental_count == artifacts.len() - 1`
//! - `last_marker` equals the `range_end` of the newest artifact
//!
//! [`Manifest::validate`] reports the first violation and
//! [`ManifestStore::save`] refuses to persist a manifest that has one.
//!
//! ## Local layout
//!
//! ```text
//! <state_dir>/<target>/
//! ├── manifest.json   committed manifest
//! ├── artifacts/      blobs produced locally (upload cache)
//! ├── codec/          codec-private state
//! └── .lock           advisory lock file
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

use crate::codec::SnapshotInfo;
use crate::error::{ChainError, Result};
use crate::types::{ArtifactKind, ArtifactStats, TargetKind};
use crate::utils;

/// File name of a manifest, locally and remotely
pub const MANIFEST_FILE: &str = "manifest.json";

/// One immutable snapshot blob in a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Full or incremental
    pub kind: ArtifactKind,
    /// Blob name, unique within the target's namespace
    pub filename: String,
    /// Marker the artifact starts from (`None` for full artifacts)
    pub range_start: Option<String>,
    /// Marker of the source state the artifact reconstructs
    pub range_end: String,
    /// Blob size in bytes
    pub size_bytes: u64,
    /// SHA-256 of the blob bytes
    pub checksum: String,
    /// When the blob was produced
    pub created_at: DateTime<Utc>,
    /// Shape of the source at `range_end`, used by restore verification
    #[serde(default)]
    pub stats: ArtifactStats,
}

impl Artifact {
    /// Describe a blob the codec just wrote to `blob`
    ///
    /// Size and checksum are taken from the file on disk.
    pub fn from_blob(
        kind: ArtifactKind,
        filename: String,
        range_start: Option<String>,
        info: SnapshotInfo,
        blob: &Path,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            filename,
            range_start,
            range_end: info.range_end,
            size_bytes: fs::metadata(blob)?.len(),
            checksum: utils::hash_file_content(blob)?,
            created_at,
            stats: info.stats,
        })
    }
}

/// Name for a new artifact: `{kind}-{YYYYMMDDTHHMMSSZ}-{uuid8}.{ext}`
///
/// The random suffix keeps names unique when two artifacts are produced
/// within the same second.
pub fn artifact_filename(kind: ArtifactKind, at: DateTime<Utc>, extension: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}.{}", kind, utils::compact_timestamp(at), &id[..8], extension)
}

/// Record of one consolidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    /// When the consolidation committed
    pub date: DateTime<Utc>,
    /// Incrementals folded into the new full artifact
    pub previous_incremental_count: u64,
    /// Remote prefix the superseded artifacts were relocated to
    pub archive_location: String,
}

/// First chain invariant a manifest breaks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    /// The chain does not start with a full artifact
    #[error("artifact #0 ({0}) is not a full artifact")]
    HeadNotFull(String),

    /// A full artifact appears after the head
    #[error("artifact #{position} ({filename}) is a full artifact after the head")]
    FullAfterHead {
        /// Position in the chain
        position: usize,
        /// Artifact file name
        filename: String,
    },

    /// An incremental does not start where its predecessor ends
    #[error("artifact #{position} ({filename}) does not continue from the previous artifact")]
    Gap {
        /// Position of the first artifact after the gap
        position: usize,
        /// Artifact file name
        filename: String,
    },

    /// Two artifacts share a file name
    #[error("file name {0} appears more than once")]
    DuplicateFilename(String),

    /// `incremental_count` disagrees with the chain length
    #[error("incremental_count is {recorded} but the chain holds {actual} incrementals")]
    CountMismatch {
        /// Value stored in the manifest
        recorded: u64,
        /// Value implied by the artifact list
        actual: u64,
    },

    /// `last_marker` is not the newest artifact's `range_end`
    #[error("last_marker {last_marker} does not match the newest range_end {range_end}")]
    MarkerMismatch {
        /// Value stored in the manifest
        last_marker: String,
        /// `range_end` of the newest artifact
        range_end: String,
    },
}

/// Durable description of one target's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Absolute source path
    pub source_path: PathBuf,
    /// Target kind
    pub target_kind: TargetKind,
    /// Host that produced the chain
    pub hostname: String,
    /// Marker the next incremental starts from
    pub last_marker: String,
    /// Incrementals since the last full artifact
    pub incremental_count: u64,
    /// Chain in replay order
    pub artifacts: Vec<Artifact>,
    /// Every consolidation, oldest first
    #[serde(default)]
    pub consolidation_history: Vec<ConsolidationEvent>,
}

impl Manifest {
    /// Create an empty manifest for a new target
    pub fn new(source_path: impl Into<PathBuf>, target_kind: TargetKind, hostname: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            target_kind,
            hostname: hostname.into(),
            last_marker: String::new(),
            incremental_count: 0,
            artifacts: Vec::new(),
            consolidation_history: Vec::new(),
        }
    }

    /// Number of artifacts in the chain
    pub fn chain_length(&self) -> usize {
        self.artifacts.len()
    }

    /// Whether the chain has no artifacts yet
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// The full artifact at the head of the chain
    pub fn head(&self) -> Option<&Artifact> {
        self.artifacts.first()
    }

    /// The newest artifact
    pub fn tail(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// File names referenced by the chain
    pub fn filenames(&self) -> HashSet<&str> {
        self.artifacts.iter().map(|a| a.filename.as_str()).collect()
    }

    /// Check every chain invariant and report the first violation
    pub fn validate(&self) -> std::result::Result<(), ChainViolation> {
        let Some(head) = self.artifacts.first() else {
            if self.incremental_count != 0 {
                return Err(ChainViolation::CountMismatch {
                    recorded: self.incremental_count,
                    actual: 0,
                });
            }
            return Ok(());
        };

        if head.kind != ArtifactKind::Full {
            return Err(ChainViolation::HeadNotFull(head.filename.clone()));
        }

        let mut seen = HashSet::new();
        seen.insert(head.filename.as_str());
        for (position, pair) in self.artifacts.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            let position = position + 1;
            if next.kind != ArtifactKind::Incremental {
                return Err(ChainViolation::FullAfterHead {
                    position,
                    filename: next.filename.clone(),
                });
            }
            if next.range_start.as_deref() != Some(prev.range_end.as_str()) {
                return Err(ChainViolation::Gap {
                    position,
                    filename: next.filename.clone(),
                });
            }
            if !seen.insert(next.filename.as_str()) {
                return Err(ChainViolation::DuplicateFilename(next.filename.clone()));
            }
        }

        let actual = (self.artifacts.len() - 1) as u64;
        if self.incremental_count != actual {
            return Err(ChainViolation::CountMismatch {
                recorded: self.incremental_count,
                actual,
            });
        }

        let range_end = &self.artifacts[self.artifacts.len() - 1].range_end;
        if &self.last_marker != range_end {
            return Err(ChainViolation::MarkerMismatch {
                last_marker: self.last_marker.clone(),
                range_end: range_end.clone(),
            });
        }
        Ok(())
    }

    /// Append an artifact to the chain and advance `last_marker`
    ///
    /// A full artifact may only start an empty chain; an incremental must
    /// continue from the newest artifact. Use [`Manifest::reset_chain`] to
    /// replace a chain with a fresh full artifact.
    pub fn append_artifact(&mut self, artifact: Artifact) -> Result<()> {
        match (artifact.kind, self.artifacts.last()) {
            (ArtifactKind::Full, None) => {}
            (ArtifactKind::Full, Some(_)) => {
                return Err(ChainError::internal(format!(
                    "cannot append full artifact {} to a non-empty chain",
                    artifact.filename
                )));
            }
            (ArtifactKind::Incremental, None) => {
                return Err(ChainError::internal(format!(
                    "cannot start a chain with incremental artifact {}",
                    artifact.filename
                )));
            }
            (ArtifactKind::Incremental, Some(prev)) => {
                if artifact.range_start.as_deref() != Some(prev.range_end.as_str()) {
                    return Err(ChainError::internal(format!(
                        "incremental {} starts at {:?} but the chain ends at {}",
                        artifact.filename, artifact.range_start, prev.range_end
                    )));
                }
                self.incremental_count += 1;
            }
        }
        self.last_marker = artifact.range_end.clone();
        self.artifacts.push(artifact);
        Ok(())
    }

    /// Replace the whole chain with a single full artifact
    ///
    /// Returns the superseded artifacts.
    pub fn reset_chain(&mut self, full: Artifact) -> Result<Vec<Artifact>> {
        if full.kind != ArtifactKind::Full {
            return Err(ChainError::internal(format!(
                "cannot reset chain to incremental artifact {}",
                full.filename
            )));
        }
        self.last_marker = full.range_end.clone();
        self.incremental_count = 0;
        Ok(std::mem::replace(&mut self.artifacts, vec![full]))
    }

    /// Collapse the chain into `full` and record the consolidation
    ///
    /// `full` must reconstruct the same state as the chain it replaces.
    /// Returns the superseded artifacts.
    pub fn record_consolidation(&mut self, full: Artifact, event: ConsolidationEvent) -> Result<Vec<Artifact>> {
        let range_end = self
            .tail()
            .map(|a| a.range_end.clone())
            .ok_or_else(|| ChainError::internal("cannot consolidate an empty chain"))?;
        if full.range_end != range_end {
            return Err(ChainError::internal(format!(
                "consolidated artifact ends at {} but the chain ends at {}",
                full.range_end, range_end
            )));
        }
        let superseded = self.reset_chain(full)?;
        self.consolidation_history.push(event);
        Ok(superseded)
    }

    /// Serialize to the pretty JSON stored on disk and remotely
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse a manifest; invariants are checked separately by [`Manifest::validate`]
    pub fn from_json(target: &str, bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes).map_err(|e| ChainError::InvalidManifest {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(manifest)
    }
}

/// Local manifest store rooted at the engine's state directory
///
/// `save` is the only write path for manifests. Callers serialize access per
/// target with [`crate::lock::with_target_lock`].
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Create a store rooted at `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { root: state_dir.into() }
    }

    /// Root of the state directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything local to `target`
    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }

    /// Path of the committed manifest
    pub fn manifest_path(&self, target: &str) -> PathBuf {
        self.target_dir(target).join(MANIFEST_FILE)
    }

    /// Upload cache for produced artifacts
    pub fn artifacts_dir(&self, target: &str) -> PathBuf {
        self.target_dir(target).join("artifacts")
    }

    /// Cached copy of one artifact
    pub fn artifact_path(&self, target: &str, filename: &str) -> PathBuf {
        self.artifacts_dir(target).join(filename)
    }

    /// Codec-private state directory
    pub fn codec_dir(&self, target: &str) -> PathBuf {
        self.target_dir(target).join("codec")
    }

    /// Advisory lock file
    pub fn lock_path(&self, target: &str) -> PathBuf {
        self.target_dir(target).join(".lock")
    }

    /// Create the per-target directories
    pub fn ensure_layout(&self, target: &str) -> Result<()> {
        fs::create_dir_all(self.artifacts_dir(target))?;
        fs::create_dir_all(self.codec_dir(target))?;
        Ok(())
    }

    /// Load the committed manifest, `None` if the target was never synced
    pub fn load(&self, target: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(target);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("No local manifest for {}", target);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Manifest::from_json(target, &bytes).map(Some)
    }

    /// Atomically persist a manifest
    ///
    /// The manifest is validated first; a manifest breaking a chain
    /// invariant is never written.
    pub fn save(&self, target: &str, manifest: &Manifest) -> Result<()> {
        manifest.validate().map_err(|v| ChainError::InvalidManifest {
            target: target.to_string(),
            reason: v.to_string(),
        })?;
        let bytes = manifest.to_json()?;
        utils::atomic_write(&self.manifest_path(target), &bytes)?;
        debug!(
            name = target,
            chain_length = manifest.chain_length(),
            incremental_count = manifest.incremental_count,
            "Saved manifest"
        );
        Ok(())
    }

    /// Names of every target with a committed manifest, sorted
    ///
    /// Includes targets no longer present in the configuration.
    pub fn list_targets(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a cached artifact; a missing file is not an error
    pub fn remove_cached(&self, target: &str, filename: &str) -> Result<()> {
        match fs::remove_file(self.artifact_path(target, filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
