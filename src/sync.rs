//! Sync driver: one policy decision, at most one new artifact, per call
//!
//! ```text
//! reconcile remote ─▶ load manifest ─▶ probe source ─▶ decide
//!        ─▶ [consolidate] ─▶ create blob ─▶ save manifest
//!        ─▶ upload blob ─▶ upload manifest (commit)
//! ```
//!
//! The local manifest is only saved after the codec produced the blob, so a
//! codec failure or timeout leaves it in its previous state. The blob stays in
//! the local upload cache; if an upload fails after the save, the next sync
//! starts by re-sending the same blob and manifest instead of recomputing
//! them.

use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::codec::{SnapshotCodec, SnapshotMode};
use crate::config::TargetConfig;
use crate::consolidation::Consolidator;
use crate::error::{ChainError, Result};
use crate::lock::with_target_lock;
use crate::manifest::{artifact_filename, Artifact, Manifest, ManifestStore};
use crate::policy::{Action, ChainPolicy};
use crate::restore;
use crate::transport::{chain_key, chain_prefix, manifest_key, BlobTransport, TransportError};
use crate::types::{ArtifactKind, SyncAction, SyncOutcome};

/// Drives one target from its current state to a committed new artifact
pub struct SyncDriver<'a> {
    target: &'a TargetConfig,
    codec: &'a dyn SnapshotCodec,
    transport: &'a dyn BlobTransport,
    store: &'a ManifestStore,
    policy: &'a ChainPolicy,
    hostname: &'a str,
}

impl<'a> SyncDriver<'a> {
    /// Create a driver for one target
    pub fn new(
        target: &'a TargetConfig,
        codec: &'a dyn SnapshotCodec,
        transport: &'a dyn BlobTransport,
        store: &'a ManifestStore,
        policy: &'a ChainPolicy,
        hostname: &'a str,
    ) -> Self {
        Self {
            target,
            codec,
            transport,
            store,
            policy,
            hostname,
        }
    }

    fn name(&self) -> &str {
        &self.target.name
    }

    /// Sync the target under its lock
    #[instrument(skip(self), fields(name = %self.target.name))]
    pub fn sync(&self) -> Result<SyncOutcome> {
        with_target_lock(self.store, self.name(), || self.sync_locked())
    }

    fn sync_locked(&self) -> Result<SyncOutcome> {
        let start = Instant::now();
        self.store.ensure_layout(self.name())?;

        let mut manifest = load_or_adopt(self.store, self.transport, self.name())?;
        if let Some(existing) = &manifest {
            if existing.target_kind != self.codec.target_kind() {
                return Err(ChainError::config(format!(
                    "target {} is configured as {} but its chain holds {} artifacts",
                    self.name(),
                    self.codec.target_kind(),
                    existing.target_kind
                )));
            }
            reconcile(self.store, self.transport, self.name(), existing)?;
        }

        let probe = self.codec.probe(&self.target.path)?;
        let now = Utc::now();
        let decision = self.policy.decide(manifest.as_ref(), &probe, now);
        debug!(
            marker = %probe.marker,
            size_bytes = probe.size_bytes,
            action = ?decision.action,
            consolidate_first = decision.consolidate_first,
            "Policy decision"
        );

        let mut consolidated = false;
        if decision.consolidate_first {
            if let Some(current) = &manifest {
                manifest = Some(self.consolidate(current)?);
                consolidated = true;
            }
        }

        let artifact = match decision.action {
            Action::NoOp => {
                info!("{} unchanged since {}", self.name(), probe.marker);
                return Ok(SyncOutcome {
                    target: self.name().to_string(),
                    action: SyncAction::NoOp,
                    consolidated,
                    artifact: None,
                    chain_length: manifest.as_ref().map_or(0, Manifest::chain_length),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            Action::Full => self.create(None)?,
            Action::Incremental { since } => match self.create(Some(&since)) {
                Err(ChainError::BaseStateMissing(marker)) => {
                    warn!("Codec state for {} is missing, rebuilding it from the chain", marker);
                    match (&manifest, consolidated) {
                        (Some(current), false) => {
                            manifest = Some(self.consolidate(current)?);
                            consolidated = true;
                            match self.create(Some(&since)) {
                                Err(ChainError::BaseStateMissing(_)) => self.create(None)?,
                                other => other?,
                            }
                        }
                        _ => self.create(None)?,
                    }
                }
                other => other?,
            },
        };

        self.commit(manifest, artifact, consolidated, start)
    }

    fn consolidate(&self, manifest: &Manifest) -> Result<Manifest> {
        Consolidator::new(self.name(), self.codec, self.transport, self.store).consolidate(manifest, Utc::now())
    }

    /// Produce a blob in the upload cache; `since` selects an incremental
    fn create(&self, since: Option<&str>) -> Result<Artifact> {
        let now = Utc::now();
        let kind = if since.is_some() {
            ArtifactKind::Incremental
        } else {
            ArtifactKind::Full
        };
        let mode = match since {
            Some(since) => SnapshotMode::Incremental { since },
            None => SnapshotMode::Full,
        };
        let filename = artifact_filename(kind, now, self.codec.extension());
        let out = self.store.artifact_path(self.name(), &filename);

        let info = match self.codec.create(&self.target.path, mode, &out) {
            Ok(info) => info,
            Err(e) => {
                let _ = fs::remove_file(&out);
                return Err(e);
            }
        };
        Artifact::from_blob(kind, filename, since.map(str::to_string), info, &out, now)
    }

    fn commit(
        &self,
        manifest: Option<Manifest>,
        artifact: Artifact,
        consolidated: bool,
        start: Instant,
    ) -> Result<SyncOutcome> {
        let mut manifest = manifest
            .unwrap_or_else(|| Manifest::new(&self.target.path, self.codec.target_kind(), self.hostname));
        let filename = artifact.filename.clone();

        let (action, superseded) = match artifact.kind {
            ArtifactKind::Full if !manifest.is_empty() => (SyncAction::Full, manifest.reset_chain(artifact.clone())?),
            ArtifactKind::Full => {
                manifest.append_artifact(artifact.clone())?;
                (SyncAction::Full, Vec::new())
            }
            ArtifactKind::Incremental => {
                manifest.append_artifact(artifact.clone())?;
                (SyncAction::Incremental, Vec::new())
            }
        };
        self.store.save(self.name(), &manifest)?;

        let blob = self.store.artifact_path(self.name(), &filename);
        self.transport.put(&chain_key(self.name(), &filename), &blob)?;
        self.transport
            .put(&manifest_key(self.name()), &self.store.manifest_path(self.name()))?;

        for old in superseded.iter().filter(|a| a.filename != filename) {
            if let Err(e) = self.transport.delete(&chain_key(self.name(), &old.filename)) {
                warn!("Could not remove superseded {}: {}", old.filename, e);
            }
            if let Err(e) = self.store.remove_cached(self.name(), &old.filename) {
                warn!("Could not remove cached {}: {}", old.filename, e);
            }
        }

        info!(
            "Synced {}: {} artifact {} ({} bytes), chain length {}",
            self.name(),
            artifact.kind,
            filename,
            artifact.size_bytes,
            manifest.chain_length()
        );
        Ok(SyncOutcome {
            target: self.name().to_string(),
            action,
            consolidated,
            artifact: Some(artifact),
            chain_length: manifest.chain_length(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Local manifest, or the committed remote one when the state directory was lost
pub(crate) fn load_or_adopt(
    store: &ManifestStore,
    transport: &dyn BlobTransport,
    target: &str,
) -> Result<Option<Manifest>> {
    if let Some(manifest) = store.load(target)? {
        return Ok(Some(manifest));
    }
    fs::create_dir_all(store.target_dir(target))?;
    let scratch = tempfile::Builder::new()
        .prefix("adopt-")
        .tempdir_in(store.target_dir(target))?;
    let Some(remote) = restore::fetch_remote_manifest(transport, target, scratch.path())? else {
        return Ok(None);
    };
    info!(
        "No local state for {}, adopting the remote chain of {} artifacts",
        target,
        remote.chain_length()
    );
    store.save(target, &remote)?;
    Ok(Some(remote))
}

/// Bring the remote in line with the local manifest
///
/// Re-sends cached blobs the remote is missing, re-sends the manifest when
/// the remote copy differs and removes live blobs the manifest no longer
/// references. Finishes whatever a previous sync or consolidation could not
/// upload or delete.
pub(crate) fn reconcile(
    store: &ManifestStore,
    transport: &dyn BlobTransport,
    target: &str,
    manifest: &Manifest,
) -> Result<()> {
    let prefix = chain_prefix(target);
    let live: HashSet<String> = transport.list(&prefix)?.into_iter().collect();

    for artifact in &manifest.artifacts {
        let key = chain_key(target, &artifact.filename);
        if live.contains(&key) {
            continue;
        }
        let cached = store.artifact_path(target, &artifact.filename);
        if cached.is_file() {
            info!("Re-uploading {} for {}", artifact.filename, target);
            transport.put(&key, &cached)?;
        } else {
            warn!(
                "{} of {} is missing remotely and not cached locally",
                artifact.filename, target
            );
        }
    }

    let local_path = store.manifest_path(target);
    let local = fs::read(&local_path)?;
    let scratch = tempfile::Builder::new()
        .prefix("reconcile-")
        .tempdir_in(store.target_dir(target))?;
    let remote_path = scratch.path().join("remote-manifest.json");
    let in_sync = match transport.get(&manifest_key(target), &remote_path) {
        Ok(()) => fs::read(&remote_path)? == local,
        Err(TransportError::NotFound(_)) => false,
        Err(e) => return Err(e.into()),
    };
    if !in_sync {
        info!("Re-uploading manifest for {}", target);
        transport.put(&manifest_key(target), &local_path)?;
    }

    let referenced = manifest.filenames();
    for key in &live {
        let filename = key.strip_prefix(&prefix).unwrap_or(key);
        if !referenced.contains(filename) {
            debug!("Removing unreferenced live blob {}", key);
            if let Err(e) = transport.delete(key) {
                warn!("Could not remove {}: {}", key, e);
            }
        }
    }
    Ok(())
}
