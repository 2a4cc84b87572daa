//! Per-host facade over every configured target
//!
//! [`ChainEngine`] owns the configuration, the local state store and the
//! remote transport, and exposes the operations the command line offers:
//! sync (one target or all of them in parallel), consolidate, restore,
//! verify and list.

use chrono::Utc;
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::codec::{self, SnapshotCodec};
use crate::config::{validate_target_name, EngineConfig, TargetConfig};
use crate::consolidation::Consolidator;
use crate::error::{ChainError, Result};
use crate::lock::with_target_lock;
use crate::manifest::{Manifest, ManifestStore};
use crate::policy::ChainPolicy;
use crate::restore::{ManifestSource, RestoreEngine};
use crate::sync::{self as sync_driver, SyncDriver};
use crate::transport::{self, BlobTransport};
use crate::types::{RestoreReport, SyncOutcome, TargetKind, TargetSummary};

/// Result of one target inside a batch operation
#[derive(Debug)]
pub struct TargetResult<T> {
    /// Target name
    pub target: String,
    /// Outcome for this target
    pub result: Result<T>,
}

/// Results of an operation run over several targets
#[derive(Debug)]
pub struct BatchReport<T> {
    /// One entry per target, in configuration order
    pub results: Vec<TargetResult<T>>,
}

impl<T> BatchReport<T> {
    /// Number of targets that succeeded
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_ok()).count()
    }

    /// Number of targets that failed
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// `0` when every target succeeded, `1` when all failed, `2` otherwise
    pub fn exit_code(&self) -> i32 {
        match (self.succeeded(), self.failed()) {
            (_, 0) => 0,
            (0, _) => 1,
            _ => 2,
        }
    }
}

/// Builder for [`ChainEngine`]
///
/// # Examples
///
/// ```rust,no_run
/// use chainback::{ChainEngineBuilder, EngineConfig, RemoteConfig, TargetConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut config = EngineConfig::new("/var/lib/chainback", RemoteConfig::local("/mnt/backup"));
/// config.targets.push(TargetConfig::directory("dotfiles", "/home/me/dotfiles"));
///
/// let engine = ChainEngineBuilder::new(config).build()?;
/// let outcome = engine.sync("dotfiles")?;
/// println!("{}: {}", outcome.target, outcome.action);
/// # Ok(())
/// # }
/// ```
pub struct ChainEngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn BlobTransport>>,
}

impl ChainEngineBuilder {
    /// Start from a configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Use `transport` instead of the backend named in the configuration
    ///
    /// Drills and tests pass a [`crate::transport::MemoryTransport`] here.
    pub fn transport(mut self, transport: Arc<dyn BlobTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<ChainEngine> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::transport_from_config(&self.config.remote)?,
        };
        let hostname = self.config.hostname();
        debug!(
            state_dir = ?self.config.state_dir,
            targets = self.config.targets.len(),
            "Engine ready"
        );
        Ok(ChainEngine {
            store: ManifestStore::new(&self.config.state_dir),
            policy: ChainPolicy::new(self.config.policy.clone()),
            config: self.config,
            transport,
            hostname,
        })
    }
}

/// Backup engine for every target on this host
pub struct ChainEngine {
    config: EngineConfig,
    store: ManifestStore,
    transport: Arc<dyn BlobTransport>,
    policy: ChainPolicy,
    hostname: String,
}

impl ChainEngine {
    /// Build an engine using the transport the configuration names
    pub fn new(config: EngineConfig) -> Result<Self> {
        ChainEngineBuilder::new(config).build()
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local state store
    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Remote transport
    pub fn transport(&self) -> &dyn BlobTransport {
        self.transport.as_ref()
    }

    fn codec(&self, target: &TargetConfig) -> Result<Arc<dyn SnapshotCodec>> {
        codec::for_target(target, &self.config.codec, &self.store)
    }

    /// Sync one configured target
    pub fn sync(&self, target: &str) -> Result<SyncOutcome> {
        let target = self.config.target(target)?;
        let codec = self.codec(target)?;
        SyncDriver::new(
            target,
            codec.as_ref(),
            self.transport.as_ref(),
            &self.store,
            &self.policy,
            &self.hostname,
        )
        .sync()
    }

    /// Sync every configured target on a pool of `jobs` threads
    ///
    /// Targets are independent: one failing does not stop the others.
    /// `None` uses one thread per CPU.
    #[instrument(skip(self))]
    pub fn sync_all(&self, jobs: Option<usize>) -> Result<BatchReport<SyncOutcome>> {
        let jobs = jobs.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("chainback-sync-{i}"))
            .build()
            .map_err(|e| ChainError::internal(format!("failed to start sync pool: {e}")))?;

        info!("Syncing {} targets with {} jobs", self.config.targets.len(), jobs);
        let results: Vec<_> = pool.install(|| {
            self.config
                .targets
                .par_iter()
                .map(|target| TargetResult {
                    target: target.name.clone(),
                    result: self.sync(&target.name),
                })
                .collect()
        });
        Ok(BatchReport { results })
    }

    /// Consolidate one target now, regardless of its thresholds
    ///
    /// Returns the new manifest.
    pub fn consolidate(&self, target: &str) -> Result<Manifest> {
        let target = self.config.target(target)?;
        let codec = self.codec(target)?;
        let name = target.name.as_str();
        with_target_lock(&self.store, name, || {
            self.store.ensure_layout(name)?;
            let manifest = sync_driver::load_or_adopt(&self.store, self.transport.as_ref(), name)?
                .ok_or_else(|| ChainError::ManifestNotFound(name.to_string()))?;
            sync_driver::reconcile(&self.store, self.transport.as_ref(), name, &manifest)?;
            Consolidator::new(name, codec.as_ref(), self.transport.as_ref(), &self.store)
                .consolidate(&manifest, Utc::now())
        })
    }

    /// Consolidate every target whose count or age threshold is met
    ///
    /// Targets with nothing to do report `Ok(None)`.
    pub fn consolidate_due(&self) -> BatchReport<Option<Manifest>> {
        let now = Utc::now();
        let results = self
            .config
            .targets
            .iter()
            .map(|target| {
                let result = self.store.load(&target.name).and_then(|manifest| match manifest {
                    Some(m) if self.policy.consolidation_due(&m, now) => self.consolidate(&target.name).map(Some),
                    _ => {
                        debug!("{} does not need consolidation", target.name);
                        Ok(None)
                    }
                });
                TargetResult {
                    target: target.name.clone(),
                    result,
                }
            })
            .collect();
        BatchReport { results }
    }

    /// Restore a target's chain into `destination`
    ///
    /// Targets that are no longer configured can still be restored; their
    /// kind and source path come from the manifest.
    pub fn restore(&self, target: &str, destination: &Path, source: ManifestSource) -> Result<RestoreReport> {
        validate_target_name(target)?;
        let run = || {
            let engine = RestoreEngine::new(target, self.transport.as_ref(), &self.store);
            let manifest = engine.load_manifest(source)?;
            let codec = self.restore_codec(target, &manifest)?;
            engine.restore(&manifest, codec.as_ref(), destination)
        };
        match source {
            ManifestSource::Local => with_target_lock(&self.store, target, run),
            ManifestSource::Remote => run(),
        }
    }

    /// Restore a target into a scratch directory and report the verdict
    pub fn verify(&self, target: &str, source: ManifestSource) -> Result<RestoreReport> {
        validate_target_name(target)?;
        let run = || {
            let engine = RestoreEngine::new(target, self.transport.as_ref(), &self.store);
            let manifest = engine.load_manifest(source)?;
            let codec = self.restore_codec(target, &manifest)?;
            engine.verify(&manifest, codec.as_ref())
        };
        match source {
            ManifestSource::Local => with_target_lock(&self.store, target, run),
            ManifestSource::Remote => run(),
        }
    }

    fn restore_codec(&self, name: &str, manifest: &Manifest) -> Result<Arc<dyn SnapshotCodec>> {
        let target = match self.config.target(name) {
            Ok(target) => target.clone(),
            Err(_) => TargetConfig {
                name: name.to_string(),
                path: manifest.source_path.clone(),
                kind: Some(manifest.target_kind),
                exclude: Vec::new(),
            },
        };
        codec::for_kind(manifest.target_kind, &target, &self.config.codec, &self.store)
    }

    /// Summaries of configured targets, followed by any target that still
    /// has local state but is no longer configured
    pub fn list(&self) -> Result<Vec<TargetSummary>> {
        let mut summaries = Vec::new();
        for target in &self.config.targets {
            let manifest = self.store.load(&target.name)?;
            summaries.push(summarize(&target.name, target.kind(), manifest.as_ref()));
        }
        for name in self.store.list_targets()? {
            if self.config.targets.iter().any(|t| t.name == name) {
                continue;
            }
            if let Some(manifest) = self.store.load(&name)? {
                summaries.push(summarize(&name, manifest.target_kind, Some(&manifest)));
            }
        }
        Ok(summaries)
    }
}

fn summarize(name: &str, kind: TargetKind, manifest: Option<&Manifest>) -> TargetSummary {
    TargetSummary {
        name: name.to_string(),
        kind: manifest.map_or(kind, |m| m.target_kind),
        chain_length: manifest.map(Manifest::chain_length),
        incremental_count: manifest.map(|m| m.incremental_count),
        last_sync: manifest.and_then(Manifest::tail).map(|a| a.created_at),
        consolidations: manifest.map_or(0, |m| m.consolidation_history.len()),
    }
}
