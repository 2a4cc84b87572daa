//! Chain policy: full, incremental or nothing, and whether to consolidate first
//!
//! Small sources are always re-snapshotted in full; they gain nothing from a
//! chain and a single full artifact is the simplest thing to restore. Large
//! sources append incrementals, bounded in length by a count threshold and in
//! age by the age of the chain's full artifact.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::config::PolicyConfig;
use crate::manifest::Manifest;
use crate::types::SourceProbe;

/// Kind of artifact the next sync produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Produce a full artifact (and reset any existing chain to it)
    Full,
    /// Produce an incremental starting at `since`
    Incremental {
        /// Marker the incremental starts from
        since: String,
    },
    /// Source unchanged; produce nothing
    NoOp,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What to produce
    pub action: Action,
    /// Whether the chain must be consolidated before producing it
    pub consolidate_first: bool,
}

impl Decision {
    fn new(action: Action, consolidate_first: bool) -> Self {
        Self {
            action,
            consolidate_first,
        }
    }
}

/// Stateless policy evaluator over the configured thresholds
#[derive(Debug, Clone)]
pub struct ChainPolicy {
    config: PolicyConfig,
}

impl ChainPolicy {
    /// Create a policy from thresholds
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Thresholds in use
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decide what the next sync does
    ///
    /// Rules are applied in order:
    /// 1. no manifest or empty chain: full
    /// 2. marker unchanged: no-op
    /// 3. count or age threshold reached: consolidate first
    /// 4. size at or below the threshold: full
    /// 5. otherwise: incremental from `last_marker`
    ///
    /// A full decision replaces the chain, so it never asks for a
    /// consolidation.
    pub fn decide(&self, manifest: Option<&Manifest>, probe: &SourceProbe, now: DateTime<Utc>) -> Decision {
        let manifest = match manifest {
            Some(m) if !m.is_empty() => m,
            _ => return Decision::new(Action::Full, false),
        };

        if probe.marker == manifest.last_marker {
            trace!("Marker {} unchanged", probe.marker);
            return Decision::new(Action::NoOp, false);
        }

        if probe.size_bytes <= self.config.size_threshold {
            return Decision::new(Action::Full, false);
        }

        Decision::new(
            Action::Incremental {
                since: manifest.last_marker.clone(),
            },
            self.consolidation_due(manifest, now),
        )
    }

    /// Whether the chain has reached its count or age threshold
    pub fn consolidation_due(&self, manifest: &Manifest, now: DateTime<Utc>) -> bool {
        let Some(head) = manifest.head() else {
            return false;
        };
        if manifest.incremental_count >= self.config.consolidation_count {
            return true;
        }
        // A head stamped in the future is never overdue
        (now - head.created_at)
            .to_std()
            .is_ok_and(|age| age >= self.config.consolidation_max_age)
    }
}
