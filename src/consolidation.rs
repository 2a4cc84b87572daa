//! Chain consolidation
//!
//! Consolidation compacts a chain into a single new full artifact so that
//! restores stay bounded in length and age. It is all-or-nothing from the
//! remote's point of view: the committed remote manifest keeps pointing at
//! the old chain until the new full artifact has been built, verified and
//! uploaded.
//!
//! ## Steps
//!
//! 1. Replay the chain into a scratch directory and snapshot the result as a
//!    full artifact. The new artifact reconstructs exactly the old chain's
//!    `range_end`, independently of what the live source looks like now.
//! 2. Apply the new artifact to a second scratch directory and inspect it.
//! 3. Copy every superseded artifact to `<target>/archive/<stamp>/`.
//! 4. Replace the chain with the new artifact and save the manifest locally.
//! 5. Upload the new artifact, then the manifest, then drop the superseded
//!    artifacts from the live prefix and the local cache.
//!
//! A failure in steps 1-3 leaves both the local and the remote manifest
//! untouched.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::codec::SnapshotCodec;
use crate::error::{ChainError, Result};
use crate::manifest::{artifact_filename, Artifact, ConsolidationEvent, Manifest, ManifestStore};
use crate::restore;
use crate::transport::{archive_prefix, chain_key, manifest_key, BlobTransport};
use crate::types::ArtifactKind;
use crate::utils;

/// Collapses one target's chain into a fresh full artifact
pub struct Consolidator<'a> {
    target: &'a str,
    codec: &'a dyn SnapshotCodec,
    transport: &'a dyn BlobTransport,
    store: &'a ManifestStore,
}

impl<'a> Consolidator<'a> {
    /// Create a consolidator for `target`
    pub fn new(
        target: &'a str,
        codec: &'a dyn SnapshotCodec,
        transport: &'a dyn BlobTransport,
        store: &'a ManifestStore,
    ) -> Self {
        Self {
            target,
            codec,
            transport,
            store,
        }
    }

    /// Consolidate `manifest` and return the committed replacement
    ///
    /// The caller must hold the target lock.
    #[instrument(skip(self, manifest), fields(name = self.target))]
    pub fn consolidate(&self, manifest: &Manifest, now: DateTime<Utc>) -> Result<Manifest> {
        let start = Instant::now();
        let tail = manifest
            .tail()
            .ok_or_else(|| self.failed("chain is empty"))?;
        manifest
            .validate()
            .map_err(|v| self.failed(format!("chain is not consistent: {v}")))?;

        info!(
            "Consolidating {} ({} artifacts, {} incrementals)",
            self.target,
            manifest.chain_length(),
            manifest.incremental_count
        );

        fs::create_dir_all(self.store.target_dir(self.target))?;
        let scratch = tempfile::Builder::new()
            .prefix("consolidate-")
            .tempdir_in(self.store.target_dir(self.target))?;

        // 1. Replay and re-snapshot
        let replay = scratch.path().join("replay");
        let mut blobs: Vec<PathBuf> = Vec::with_capacity(manifest.chain_length());
        for (position, artifact) in manifest.artifacts.iter().enumerate() {
            let blob = restore::locate_blob(self.store, self.transport, self.target, position, artifact, scratch.path())
                .map_err(|e| self.wrap(e))?;
            self.codec.apply(&blob, &replay).map_err(|e| self.wrap(e))?;
            blobs.push(blob);
        }

        let filename = artifact_filename(ArtifactKind::Full, now, self.codec.extension());
        let out = self.store.artifact_path(self.target, &filename);
        let full = self.build_full(&replay, &filename, &out, tail, now, scratch.path());
        let full = match full {
            Ok(full) => full,
            Err(e) => {
                let _ = fs::remove_file(&out);
                return Err(e);
            }
        };

        // 3. Archive superseded artifacts
        let archive = archive_prefix(self.target, &utils::compact_timestamp(now));
        for (artifact, blob) in manifest.artifacts.iter().zip(&blobs) {
            self.transport
                .put(&format!("{archive}{}", artifact.filename), blob)
                .map_err(|e| {
                    let _ = fs::remove_file(&out);
                    self.wrap(e.into())
                })?;
        }
        debug!("Archived {} artifacts under {}", blobs.len(), archive);

        // 4. Commit locally
        let mut next = manifest.clone();
        let event = ConsolidationEvent {
            date: now,
            previous_incremental_count: manifest.incremental_count,
            archive_location: archive.clone(),
        };
        let superseded = next.record_consolidation(full, event)?;
        self.store.save(self.target, &next)?;

        // 5. Publish, then retire the old chain
        self.transport.put(&chain_key(self.target, &filename), &out)?;
        self.transport
            .put(&manifest_key(self.target), &self.store.manifest_path(self.target))?;
        for old in superseded.iter().filter(|a| a.filename != filename) {
            if let Err(e) = self.transport.delete(&chain_key(self.target, &old.filename)) {
                warn!("Could not remove superseded {} from the live chain: {}", old.filename, e);
            }
            if let Err(e) = self.store.remove_cached(self.target, &old.filename) {
                warn!("Could not remove cached {}: {}", old.filename, e);
            }
        }

        info!(
            "Consolidated {} into {} in {:?}, {} artifacts archived at {}",
            self.target,
            filename,
            start.elapsed(),
            superseded.len(),
            archive
        );
        Ok(next)
    }

    /// Steps 1 and 2: snapshot the replayed tree and verify the result
    fn build_full(
        &self,
        replay: &Path,
        filename: &str,
        out: &Path,
        tail: &Artifact,
        now: DateTime<Utc>,
        scratch: &Path,
    ) -> Result<Artifact> {
        let info = self
            .codec
            .create_replayed(replay, out)
            .map_err(|e| self.wrap(e))?;
        if info.range_end != tail.range_end {
            return Err(self.failed(format!(
                "replayed chain ends at {} but the manifest records {}",
                info.range_end, tail.range_end
            )));
        }
        let full = Artifact::from_blob(ArtifactKind::Full, filename.to_string(), None, info, out, now)?;

        let check = scratch.join("check");
        self.codec.apply(out, &check).map_err(|e| self.wrap(e))?;
        let inspection = self.codec.inspect(&check, &full).map_err(|e| self.wrap(e))?;
        if !inspection.is_ok() {
            return Err(self.failed(format!("new full artifact failed verification: {}", inspection.summary())));
        }
        debug!("Verified consolidated artifact {}: {}", filename, inspection.summary());
        Ok(full)
    }

    fn failed(&self, reason: impl Into<String>) -> ChainError {
        ChainError::ConsolidationFailed {
            target: self.target.to_string(),
            reason: reason.into(),
        }
    }

    /// Keep transient failures retryable; everything else aborts the consolidation
    fn wrap(&self, err: ChainError) -> ChainError {
        if err.is_transient() {
            err
        } else {
            self.failed(err.to_string())
        }
    }
}
