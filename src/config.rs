//! Engine configuration
//!
//! Thresholds, paths and the list of targets are read from a TOML file into
//! an explicit [`EngineConfig`] that is handed to the engine at construction.
//! Nothing is read from ambient globals after that point.
//!
//! ```toml
//! state_dir = "/var/lib/chainback"
//!
//! [policy]
//! size_threshold = 268435456
//! consolidation_count = 10
//! consolidation_max_age = "30days"
//!
//! [remote]
//! backend = "rclone"
//! remote = "s3:backups/hosts"
//! timeout = "15m"
//!
//! [[targets]]
//! name = "dotfiles"
//! path = "/home/me/dotfiles"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChainError, Result};
use crate::types::TargetKind;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local directory holding manifests, cached artifacts and lock files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Hostname recorded in manifests (defaults to the machine hostname)
    #[serde(default)]
    pub hostname: Option<String>,
    /// Chain policy thresholds
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Remote blob store
    pub remote: RemoteConfig,
    /// Snapshot codec settings
    #[serde(default)]
    pub codec: CodecConfig,
    /// Configured targets
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Thresholds driving full/incremental/consolidation decisions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Sources at or below this many bytes always get a fresh full artifact
    #[serde(default = "default_size_threshold")]
    pub size_threshold: u64,
    /// Consolidate once this many incrementals follow the full artifact
    #[serde(default = "default_consolidation_count")]
    pub consolidation_count: u64,
    /// Consolidate once the full artifact is this old
    #[serde(default = "default_consolidation_max_age", with = "humantime_duration")]
    pub consolidation_max_age: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            size_threshold: default_size_threshold(),
            consolidation_count: default_consolidation_count(),
            consolidation_max_age: default_consolidation_max_age(),
        }
    }
}

/// Remote backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RemoteBackend {
    /// A local or mounted directory
    Local {
        /// Root directory of the remote namespace
        path: PathBuf,
    },
    /// Any rclone remote
    Rclone {
        /// rclone path, e.g. `s3:bucket/prefix`
        remote: String,
        /// rclone executable
        #[serde(default = "default_rclone_binary")]
        binary: String,
    },
}

/// Remote blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Backend and its location
    #[serde(flatten)]
    pub backend: RemoteBackend,
    /// Per-call timeout for networked backends (humantime, e.g. `"10m"`)
    #[serde(default = "default_remote_timeout", with = "humantime_duration")]
    pub timeout: Duration,
    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RemoteConfig {
    /// Local directory remote with default timeout and retries
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: RemoteBackend::Local { path: path.into() },
            timeout: default_remote_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient transport failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Snapshot codec settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Time budget for one external codec invocation
    #[serde(default = "default_codec_timeout", with = "humantime_duration")]
    pub timeout: Duration,
    /// Number of file hashes sampled into each directory artifact
    #[serde(default = "default_spot_checks")]
    pub spot_checks: usize,
    /// git executable used by the repository codec
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            timeout: default_codec_timeout(),
            spot_checks: default_spot_checks(),
            git_binary: default_git_binary(),
        }
    }
}

/// One configured backup target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Stable target name, used as the remote prefix
    pub name: String,
    /// Absolute source path
    pub path: PathBuf,
    /// Target kind; detected from the source when omitted
    #[serde(default)]
    pub kind: Option<TargetKind>,
    /// Glob patterns excluded from directory snapshots
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TargetConfig {
    /// Directory target without excludes
    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: Some(TargetKind::Directory),
            exclude: Vec::new(),
        }
    }

    /// Repository target
    pub fn repository(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: Some(TargetKind::Repository),
            exclude: Vec::new(),
        }
    }

    /// Resolved kind of the target
    pub fn kind(&self) -> TargetKind {
        self.kind.unwrap_or_else(|| TargetKind::detect(&self.path))
    }
}

impl EngineConfig {
    /// Minimal configuration: a state directory and a remote
    pub fn new(state_dir: impl Into<PathBuf>, remote: RemoteConfig) -> Self {
        Self {
            state_dir: state_dir.into(),
            hostname: None,
            policy: PolicyConfig::default(),
            remote,
            codec: CodecConfig::default(),
            targets: Vec::new(),
        }
    }

    /// Load and validate a configuration file
    ///
    /// Relative `state_dir` and local remote paths are resolved against the
    /// directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChainError::config(format!("cannot read {:?}: {}", path, e)))?;
        let mut config = Self::from_toml_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative(base);
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| ChainError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
        if let RemoteBackend::Local { path } = &mut self.remote.backend {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        for target in &mut self.targets {
            if target.path.is_relative() {
                target.path = base.join(&target.path);
            }
        }
    }

    /// Check thresholds and target names
    pub fn validate(&self) -> Result<()> {
        if self.policy.consolidation_count == 0 {
            return Err(ChainError::config("policy.consolidation_count must be at least 1"));
        }
        if self.policy.consolidation_max_age.is_zero() {
            return Err(ChainError::config("policy.consolidation_max_age must be positive"));
        }
        if self.remote.timeout.is_zero() {
            return Err(ChainError::config("remote.timeout must be positive"));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            validate_target_name(&target.name)?;
            if !seen.insert(target.name.as_str()) {
                return Err(ChainError::config(format!("duplicate target name '{}'", target.name)));
            }
        }
        Ok(())
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ChainError::UnknownTarget(name.to_string()))
    }

    /// Hostname to record in manifests
    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Target names become path components locally and remotely
pub fn validate_target_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ChainError::config(format!(
            "invalid target name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".chainback")
}

fn default_size_threshold() -> u64 {
    256 * 1024 * 1024
}

fn default_consolidation_count() -> u64 {
    10
}

fn default_consolidation_max_age() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_codec_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_spot_checks() -> usize {
    8
}

fn default_git_binary() -> String {
    "git".to_string()
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
