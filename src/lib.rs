//! # chainback - Chain-of-snapshots backups
//!
//! Keeps an off-host copy of a set of local targets (plain directories and
//! git repositories) as a chain of snapshot artifacts: one full artifact
//! followed by incrementals, described by a manifest stored next to them.
//!
//! ## Overview
//!
//! Every sync decides, per target, whether to:
//! - do nothing, because the source is unchanged since the last artifact
//! - replace the whole chain with a fresh full artifact, because the source is
//!   small enough that a full copy is the simplest thing to keep
//! - append an incremental, optionally after collapsing the chain into a new
//!   full artifact once it grows too long or too old
//!
//! Restoring fetches every artifact in order, checks each blob against the
//! checksum recorded in the manifest, applies the chain to an empty
//! destination and inspects the result.
//!
//! ## Architecture
//!
//! - **Manifest**: the durable description of a chain, written atomically
//!   locally and uploaded last, so the remote manifest always describes a
//!   complete chain
//! - **Policy**: a pure function from (manifest, source probe, clock) to an
//!   action
//! - **Codecs**: produce and apply blobs for one kind of target; the engine
//!   never looks inside a blob
//! - **Transport**: a remote key-value store of named blobs with retry on
//!   transient failures
//! - **Locking**: every operation that writes a target's state holds an
//!   exclusive per-target lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainback::{ChainEngine, EngineConfig, ManifestSource};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load(Path::new("chainback.toml"))?;
//! let engine = ChainEngine::new(config)?;
//!
//! // Sync every configured target on four threads
//! let report = engine.sync_all(Some(4))?;
//! for result in &report.results {
//!     match &result.result {
//!         Ok(outcome) => println!("{}: {}", result.target, outcome.action),
//!         Err(e) => eprintln!("{}: {}", result.target, e),
//!     }
//! }
//!
//! // Restore one of them from the committed remote manifest
//! let restored = engine.restore("dotfiles", Path::new("/tmp/dotfiles"), ManifestSource::Remote)?;
//! println!("{}", restored.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability
//!
//! A sync writes the new blob to the local upload cache, saves the local
//! manifest, uploads the blob and finally uploads the manifest. A crash or
//! failed upload at any point leaves the remote describing the previous
//! complete chain; the next sync re-sends what is missing before doing
//! anything else.
//!
//! Consolidation archives superseded artifacts under
//! `<target>/archive/<stamp>/` before the new manifest is committed, and only
//! deletes live copies once it is.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ChainError>`. Transport failures are
//! classified as transient or permanent ([`ChainError::is_transient`]);
//! restore and verify report bad data through [`RestoreStatus`] rather than an
//! error so the caller always learns which artifact was at fault.
//!
//! ## Module Organization
//!
//! - [`engine`]: the per-host facade used by the command line
//! - [`sync`]: one sync of one target
//! - [`policy`]: full/incremental/consolidation decisions
//! - [`consolidation`]: collapsing a chain into a single full artifact
//! - [`restore`]: fetching, replaying and verifying chains
//! - [`manifest`]: chain description and the local state store
//! - [`codec`]: directory and repository snapshot codecs
//! - [`transport`]: remote blob store backends
//! - [`lock`]: per-target locks
//! - [`config`]: TOML configuration
//! - [`types`]: common types and data structures
//! - [`error`]: error types and handling

// Public API modules
pub mod codec;
pub mod config;
pub mod consolidation;
pub mod engine;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod policy;
pub mod restore;
pub mod sync;
pub mod transport;
pub mod types;
pub mod utils;

// Internal modules (not part of public API)
mod process;

// Re-export main types for convenience
pub use codec::{DirectoryCodec, RepositoryCodec, SnapshotCodec};
pub use config::{CodecConfig, EngineConfig, PolicyConfig, RemoteBackend, RemoteConfig, RetryConfig, TargetConfig};
pub use engine::{BatchReport, ChainEngine, ChainEngineBuilder, TargetResult};
pub use error::{ChainError, Result};
pub use manifest::{Artifact, ConsolidationEvent, Manifest, ManifestStore};
pub use policy::{Action, ChainPolicy, Decision};
pub use restore::{ManifestSource, RestoreEngine};
pub use transport::{BlobTransport, LocalTransport, MemoryTransport, TransportError, TransportOperation};
pub use types::*;
