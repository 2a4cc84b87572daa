//! Restore and verification of a target from its chain
//!
//! A restore never applies a partial chain. Every artifact is fetched and
//! checksum-verified into a staging directory first; only then is the chain
//! replayed into the destination and the result inspected by the codec.
//!
//! ## Outcomes
//!
//! Expected failure classes are reported in [`RestoreReport::status`] rather
//! than as errors, so operators can tell a bad transfer
//! ([`RestoreStatus::ChecksumMismatch`]) from bad data
//! ([`RestoreStatus::StructuralFailure`]) and from a broken chain
//! ([`RestoreStatus::IncompleteChain`]). Errors are reserved for operational
//! problems such as an unreachable remote or a non-empty destination.
//!
//! [`RestoreEngine::verify`] runs the same pipeline into a scratch directory
//! that is removed afterwards, for disaster-recovery drills.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::codec::SnapshotCodec;
use crate::error::{ChainError, Result};
use crate::manifest::{Artifact, ChainViolation, Manifest, ManifestStore};
use crate::transport::{chain_key, manifest_key, BlobTransport, TransportError};
use crate::types::{RestoreReport, RestoreStatus};
use crate::utils;

/// Where restore reads the manifest from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestSource {
    /// The committed copy on the remote
    #[default]
    Remote,
    /// The local state directory
    Local,
}

/// Check a blob on disk against the checksum recorded for it
pub(crate) fn verify_checksum(path: &Path, artifact: &Artifact, position: usize) -> Result<()> {
    let actual = utils::hash_file_content(path)?;
    if actual != artifact.checksum {
        debug!(position, filename = %artifact.filename, "checksum mismatch");
        return Err(ChainError::ChecksumMismatch {
            filename: artifact.filename.clone(),
            expected: artifact.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Download one live artifact to `dest` and verify it
///
/// A missing blob is reported as [`ChainError::IncompleteChain`] at
/// `position`. Returns the number of bytes fetched.
pub(crate) fn fetch_verified(
    transport: &dyn BlobTransport,
    target: &str,
    position: usize,
    artifact: &Artifact,
    dest: &Path,
) -> Result<u64> {
    match transport.get(&chain_key(target, &artifact.filename), dest) {
        Ok(()) => {}
        Err(TransportError::NotFound(_)) => {
            return Err(ChainError::IncompleteChain {
                position,
                filename: artifact.filename.clone(),
            })
        }
        Err(e) => return Err(e.into()),
    }
    verify_checksum(dest, artifact, position)?;
    Ok(fs::metadata(dest)?.len())
}

/// Find a verified copy of an artifact, preferring the local upload cache
///
/// Falls back to downloading into `staging` when the cached copy is missing
/// or does not match its checksum.
pub(crate) fn locate_blob(
    store: &ManifestStore,
    transport: &dyn BlobTransport,
    target: &str,
    position: usize,
    artifact: &Artifact,
    staging: &Path,
) -> Result<PathBuf> {
    let cached = store.artifact_path(target, &artifact.filename);
    if cached.is_file() {
        match verify_checksum(&cached, artifact, position) {
            Ok(()) => return Ok(cached),
            Err(e) => warn!("Ignoring cached {}: {}", artifact.filename, e),
        }
    }
    let dest = staging.join(&artifact.filename);
    fetch_verified(transport, target, position, artifact, &dest)?;
    Ok(dest)
}

/// Download and parse the committed remote manifest
pub(crate) fn fetch_remote_manifest(
    transport: &dyn BlobTransport,
    target: &str,
    scratch: &Path,
) -> Result<Option<Manifest>> {
    let dest = scratch.join(format!("remote-{}", crate::manifest::MANIFEST_FILE));
    match transport.get(&manifest_key(target), &dest) {
        Ok(()) => {}
        Err(TransportError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let bytes = fs::read(&dest)?;
    fs::remove_file(&dest)?;
    Manifest::from_json(target, &bytes).map(Some)
}

/// Fetches, replays and inspects one target's chain
pub struct RestoreEngine<'a> {
    target: &'a str,
    transport: &'a dyn BlobTransport,
    store: &'a ManifestStore,
}

impl<'a> RestoreEngine<'a> {
    /// Create a restore engine for `target`
    pub fn new(target: &'a str, transport: &'a dyn BlobTransport, store: &'a ManifestStore) -> Self {
        Self {
            target,
            transport,
            store,
        }
    }

    /// Load the manifest to restore from
    pub fn load_manifest(&self, source: ManifestSource) -> Result<Manifest> {
        let manifest = match source {
            ManifestSource::Local => self.store.load(self.target)?,
            ManifestSource::Remote => {
                let scratch = TempDir::new()?;
                fetch_remote_manifest(self.transport, self.target, scratch.path())?
            }
        };
        manifest.ok_or_else(|| ChainError::ManifestNotFound(self.target.to_string()))
    }

    /// Restore `manifest`'s chain into `destination`
    ///
    /// `destination` must be missing or empty.
    #[instrument(skip(self, manifest, codec), fields(name = self.target))]
    pub fn restore(&self, manifest: &Manifest, codec: &dyn SnapshotCodec, destination: &Path) -> Result<RestoreReport> {
        let start = Instant::now();
        let mut report = RestoreReport {
            target: self.target.to_string(),
            destination: destination.to_path_buf(),
            status: RestoreStatus::Verified,
            artifacts_applied: 0,
            bytes_fetched: 0,
            duration_ms: 0,
        };

        if !utils::is_missing_or_empty(destination)? {
            return Err(ChainError::RestoreFailed(format!(
                "destination {:?} exists and is not empty",
                destination
            )));
        }
        let Some(tail) = manifest.tail() else {
            return Err(ChainError::RestoreFailed(format!("chain of {} is empty", self.target)));
        };

        match manifest.validate() {
            Ok(()) => {}
            Err(ChainViolation::Gap { position, filename }) => {
                return Ok(self.finish(report, RestoreStatus::IncompleteChain { position, filename }, start));
            }
            Err(violation) => {
                return Err(ChainError::InvalidManifest {
                    target: self.target.to_string(),
                    reason: violation.to_string(),
                });
            }
        }

        info!(
            "Restoring {} from {} artifacts into {:?}",
            self.target,
            manifest.chain_length(),
            destination
        );

        fs::create_dir_all(self.store.target_dir(self.target))?;
        let staging = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(self.store.target_dir(self.target))?;

        let mut blobs = Vec::with_capacity(manifest.chain_length());
        for (position, artifact) in manifest.artifacts.iter().enumerate() {
            let dest = staging.path().join(&artifact.filename);
            match fetch_verified(self.transport, self.target, position, artifact, &dest) {
                Ok(bytes) => report.bytes_fetched += bytes,
                Err(ChainError::IncompleteChain { position, filename }) => {
                    return Ok(self.finish(report, RestoreStatus::IncompleteChain { position, filename }, start));
                }
                Err(ChainError::ChecksumMismatch {
                    filename,
                    expected,
                    actual,
                }) => {
                    let status = RestoreStatus::ChecksumMismatch {
                        position,
                        filename,
                        expected,
                        actual,
                    };
                    return Ok(self.finish(report, status, start));
                }
                Err(e) => return Err(e),
            }
            blobs.push(dest);
        }
        debug!("Fetched {} artifacts ({})", blobs.len(), utils::format_bytes(report.bytes_fetched));

        for (artifact, blob) in manifest.artifacts.iter().zip(&blobs) {
            match codec.apply(blob, destination) {
                Ok(()) => report.artifacts_applied += 1,
                Err(e @ (ChainError::Codec { .. } | ChainError::Bincode(_))) => {
                    let reason = format!("applying {} failed: {}", artifact.filename, e);
                    return Ok(self.finish(report, RestoreStatus::StructuralFailure { reason }, start));
                }
                Err(e) => return Err(e),
            }
        }

        let inspection = codec.inspect(destination, tail)?;
        let status = if inspection.is_ok() {
            RestoreStatus::Verified
        } else {
            RestoreStatus::StructuralFailure {
                reason: inspection.summary(),
            }
        };
        Ok(self.finish(report, status, start))
    }

    /// Restore into a disposable scratch directory and report the verdict
    pub fn verify(&self, manifest: &Manifest, codec: &dyn SnapshotCodec) -> Result<RestoreReport> {
        let scratch = TempDir::new()?;
        let destination = scratch.path().join(self.target);
        self.restore(manifest, codec, &destination)
    }

    fn finish(&self, mut report: RestoreReport, status: RestoreStatus, start: Instant) -> RestoreReport {
        report.duration_ms = start.elapsed().as_millis() as u64;
        if status.is_verified() {
            info!(
                "Restore of {} verified: {} artifacts, {} in {}ms",
                self.target,
                report.artifacts_applied,
                utils::format_bytes(report.bytes_fetched),
                report.duration_ms
            );
        } else {
            warn!("Restore of {} failed verification: {}", self.target, status);
        }
        report.status = status;
        report
    }
}
