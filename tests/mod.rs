//! Main test module for chainback
//!
//! This module includes all test suites:
//! - Integration tests for whole sync/consolidate/restore cycles
//! - Chaos tests for damaged remotes and failing transports
//! - Property-based tests for chain invariants

pub mod integration;
pub mod chaos;
pub mod property;

use ::chainback::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Engine configuration, local state and an in-memory remote shared by every
/// engine the harness builds
pub struct Harness {
    pub dir: TempDir,
    pub transport: MemoryTransport,
    pub config: EngineConfig,
}

impl Harness {
    /// Harness with a 1 KiB size threshold, so small trees get full artifacts
    pub fn new() -> Self {
        Self::with_policy(1024, 10, Duration::from_secs(30 * 86400))
    }

    pub fn with_policy(size_threshold: u64, consolidation_count: u64, consolidation_max_age: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path().join("state"), RemoteConfig::local(dir.path().join("remote")));
        config.hostname = Some("test-host".into());
        config.policy = PolicyConfig {
            size_threshold,
            consolidation_count,
            consolidation_max_age,
        };
        Self {
            dir,
            transport: MemoryTransport::new(),
            config,
        }
    }

    /// Configure a directory target and return its (created) source path
    pub fn add_directory(&mut self, name: &str) -> PathBuf {
        let source = self.dir.path().join("sources").join(name);
        fs::create_dir_all(&source).unwrap();
        self.config.targets.push(TargetConfig::directory(name, &source));
        source
    }

    pub fn engine(&self) -> ChainEngine {
        ChainEngineBuilder::new(self.config.clone())
            .transport(Arc::new(self.transport.clone()))
            .build()
            .unwrap()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Manifest as committed on the remote
    pub fn remote_manifest(&self, target: &str) -> Manifest {
        let bytes = self.transport.blob(&format!("{target}/manifest.json")).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Live artifact keys of a target
    pub fn live(&self, target: &str) -> Vec<String> {
        self.transport.list(&format!("{target}/chain/")).unwrap()
    }
}

pub fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// What a path under a tree holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Link(PathBuf),
}

/// Every file, directory and symlink under `root`, by relative path
pub fn tree(root: &Path) -> BTreeMap<PathBuf, Node> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            let node = if e.file_type().is_dir() {
                Node::Dir
            } else if e.file_type().is_symlink() {
                Node::Link(fs::read_link(e.path()).unwrap())
            } else {
                Node::File(fs::read(e.path()).unwrap())
            };
            (rel, node)
        })
        .collect()
}

#[cfg(test)]
mod edge_cases {
    use super::*;

    #[test]
    fn test_empty_directory() {
        let mut harness = Harness::new();
        harness.add_directory("empty");
        let engine = harness.engine();

        let outcome = engine.sync("empty").unwrap();
        assert_eq!(outcome.action, SyncAction::Full);
        assert_eq!(outcome.artifact.unwrap().stats.file_count, 0);

        let dest = harness.path("restored");
        let report = engine.restore("empty", &dest, ManifestSource::Remote).unwrap();
        assert_eq!(report.status, RestoreStatus::Verified);
        assert!(tree(&dest).is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let mut harness = Harness::new();
        let source = harness.add_directory("special");

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "ünïcödé.txt",
            "deep/ly/nested/file.txt",
        ];
        for name in &special_names {
            write(&source, name, format!("Content of {}", name).as_bytes());
        }

        let engine = harness.engine();
        engine.sync("special").unwrap();
        let dest = harness.path("restored");
        let report = engine.restore("special", &dest, ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified(), "{}", report.status);
        assert_eq!(tree(&dest), tree(&source));
    }

    #[test]
    fn test_excluded_paths_are_not_backed_up() {
        let mut harness = Harness::new();
        let source = harness.add_directory("work");
        harness.config.targets[0].exclude = vec!["*.tmp".into(), "cache".into()];
        write(&source, "keep.txt", b"keep");
        write(&source, "scratch.tmp", b"drop");
        write(&source, "cache/blob", b"drop");
        write(&source, "sub/keep.md", b"keep");

        let engine = harness.engine();
        engine.sync("work").unwrap();

        // Changing excluded files is not a change
        write(&source, "scratch.tmp", b"still dropped");
        assert_eq!(engine.sync("work").unwrap().action, SyncAction::NoOp);

        let dest = harness.path("restored");
        engine.restore("work", &dest, ManifestSource::Remote).unwrap();
        let restored: Vec<PathBuf> = tree(&dest).into_keys().collect();
        assert_eq!(
            restored,
            [PathBuf::from("keep.txt"), PathBuf::from("sub"), PathBuf::from("sub/keep.md")]
        );
    }

    #[test]
    fn test_deleted_directories_stay_deleted() {
        let mut harness = Harness::new();
        let source = harness.add_directory("big");
        write(&source, "payload.bin", &[3u8; 8192]);
        write(&source, "old/a.txt", b"a");
        write(&source, "old/inner/b.txt", b"b");

        let engine = harness.engine();
        engine.sync("big").unwrap();
        fs::remove_dir_all(source.join("old")).unwrap();
        write(&source, "new.txt", b"new");
        assert_eq!(engine.sync("big").unwrap().action, SyncAction::Incremental);

        let dest = harness.path("restored");
        let report = engine.restore("big", &dest, ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified());
        assert_eq!(report.artifacts_applied, 2);
        assert!(!dest.join("old").exists());
        assert_eq!(tree(&dest), tree(&source));
    }

    #[test]
    fn test_empty_directories_survive_restore() {
        let mut harness = Harness::new();
        let source = harness.add_directory("layout");
        write(&source, "payload.bin", &[6u8; 4096]);
        fs::create_dir_all(source.join("logs/empty")).unwrap();
        let engine = harness.engine();
        engine.sync("layout").unwrap();

        // Creating an empty directory alone is a change
        fs::create_dir_all(source.join("spool/outgoing")).unwrap();
        assert_eq!(engine.sync("layout").unwrap().action, SyncAction::Incremental);
        fs::remove_dir(source.join("logs/empty")).unwrap();
        assert_eq!(engine.sync("layout").unwrap().action, SyncAction::Incremental);

        let dest = harness.path("restored");
        let report = engine.restore("layout", &dest, ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified(), "{}", report.status);
        assert!(dest.join("spool/outgoing").is_dir());
        assert!(dest.join("logs").is_dir());
        assert!(!dest.join("logs/empty").exists());
        assert_eq!(tree(&dest), tree(&source));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_filenames_sync_and_restore() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut harness = Harness::new();
        let source = harness.add_directory("alpha");
        let name = OsStr::from_bytes(b"bad\xffname");
        write(&source, "payload.bin", &[2u8; 4096]);
        fs::create_dir_all(source.join("src")).unwrap();
        fs::write(source.join("src").join(name), b"latin-1 era file").unwrap();

        let engine = harness.engine();
        assert_eq!(engine.sync("alpha").unwrap().action, SyncAction::Full);
        fs::write(source.join("src").join(name), b"edited").unwrap();
        assert_eq!(engine.sync("alpha").unwrap().action, SyncAction::Incremental);

        let dest = harness.path("restored");
        let report = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified(), "{}", report.status);
        assert_eq!(fs::read(dest.join("src").join(name)).unwrap(), b"edited");
        assert_eq!(tree(&dest), tree(&source));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_restore_as_links() {
        let mut harness = Harness::new();
        let source = harness.add_directory("links");
        write(&source, "releases/v2/app.bin", &[1u8; 4096]);
        std::os::unix::fs::symlink("releases/v2", source.join("current")).unwrap();
        let engine = harness.engine();
        engine.sync("links").unwrap();

        let dest = harness.path("restored");
        let report = engine.restore("links", &dest, ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified(), "{}", report.status);
        assert_eq!(tree(&dest), tree(&source));
        assert_eq!(tree(&dest)[Path::new("current")], Node::Link(PathBuf::from("releases/v2")));
    }

    #[test]
    fn test_restore_refuses_non_empty_destination() {
        let mut harness = Harness::new();
        let source = harness.add_directory("alpha");
        write(&source, "a.txt", b"a");
        let engine = harness.engine();
        engine.sync("alpha").unwrap();

        let dest = harness.path("occupied");
        write(&dest, "precious.txt", b"do not touch");
        let err = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap_err();
        assert!(matches!(err, ChainError::RestoreFailed(_)));
        assert_eq!(fs::read(dest.join("precious.txt")).unwrap(), b"do not touch");
    }

    #[test]
    fn test_restore_never_synced_target() {
        let mut harness = Harness::new();
        harness.add_directory("fresh");
        let err = harness
            .engine()
            .restore("fresh", &harness.path("out"), ManifestSource::Remote)
            .unwrap_err();
        assert!(matches!(err, ChainError::ManifestNotFound(_)));
    }

    #[test]
    fn test_config_file_drives_local_remote() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("docs");
        write(&source, "readme.md", b"# docs");
        let text = format!(
            r#"
state_dir = "state"

[policy]
size_threshold = 1024
consolidation_count = 3
consolidation_max_age = "7days"

[remote]
backend = "local"
path = "remote"

[[targets]]
name = "docs"
path = "{}"
"#,
            source.display()
        );
        let config_path = dir.path().join("chainback.toml");
        fs::write(&config_path, text).unwrap();

        let engine = ChainEngine::new(EngineConfig::load(&config_path).unwrap()).unwrap();
        assert_eq!(engine.sync("docs").unwrap().action, SyncAction::Full);
        assert!(dir.path().join("remote/docs/manifest.json").is_file());
        assert!(dir.path().join("state/docs/manifest.json").is_file());

        let report = engine.verify("docs", ManifestSource::Remote).unwrap();
        assert!(report.status.is_verified());
    }
}
