//! Integration tests for chainback
//!
//! Whole sync, consolidate and restore cycles against an in-memory remote,
//! checked both through the engine's results and through what actually ends
//! up on the remote.

use ::chainback::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::time::Duration;
use tracing::info;

use crate::{tree, write, Harness};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Deterministic file contents for generated trees
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn content(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.random()).collect()
    }

    pub fn text(&mut self, lines: usize) -> String {
        (0..lines)
            .map(|i| format!("line {} value {}\n", i, self.rng.random::<u32>()))
            .collect()
    }
}

#[test]
fn test_alpha_chain_lifecycle() {
    let mut harness = Harness::with_policy(MB, 10, Duration::from_secs(30 * 86400));
    let source = harness.add_directory("alpha");
    let engine = harness.engine();

    // Small source: full artifacts only
    write(&source, "notes.txt", &[b'a'; 2048]);
    let first = engine.sync("alpha").unwrap();
    assert_eq!(first.action, SyncAction::Full);
    assert_eq!(harness.remote_manifest("alpha").incremental_count, 0);

    write(&source, "more.txt", b"more");
    let second = engine.sync("alpha").unwrap();
    assert_eq!(second.action, SyncAction::Full);
    assert_eq!(second.chain_length, 1);
    assert_eq!(harness.live("alpha").len(), 1);

    // Grown past the threshold: incrementals until the count threshold
    write(&source, "large.bin", &vec![0u8; 10 * MB as usize]);
    for i in 1..=10 {
        let outcome = engine.sync("alpha").unwrap();
        assert_eq!(outcome.action, SyncAction::Incremental, "sync {}", i);
        assert!(!outcome.consolidated);
        assert_eq!(outcome.chain_length, i + 1);
        write(&source, &format!("change-{i}.txt"), format!("change {i}").as_bytes());
    }
    let before = harness.remote_manifest("alpha");
    assert_eq!(before.incremental_count, 10);

    let eleventh = engine.sync("alpha").unwrap();
    assert_eq!(eleventh.action, SyncAction::Incremental);
    assert!(eleventh.consolidated);

    let manifest = harness.remote_manifest("alpha");
    assert_eq!(manifest.chain_length(), 2);
    assert_eq!(manifest.artifacts[0].kind, ArtifactKind::Full);
    assert_eq!(manifest.artifacts[0].range_end, before.last_marker);
    assert_eq!(manifest.artifacts[1].kind, ArtifactKind::Incremental);
    assert_eq!(manifest.incremental_count, 1);
    assert_eq!(manifest.consolidation_history.len(), 1);
    assert_eq!(manifest.consolidation_history[0].previous_incremental_count, 10);
    assert!(manifest.consolidation_history[0].archive_location.starts_with("alpha/archive/"));
    assert_eq!(harness.live("alpha").len(), 2);

    // Superseded artifacts were archived, not lost
    let archived = harness
        .transport
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("alpha/archive/"))
        .count();
    assert_eq!(archived, before.chain_length());

    let dest = harness.path("alpha-restore");
    let report = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap();
    assert_eq!(report.status, RestoreStatus::Verified);
    assert_eq!(tree(&dest), tree(&source));
    info!("alpha restored from {} artifacts", report.artifacts_applied);
}

#[test]
fn test_restore_round_trip_with_modifications() -> anyhow::Result<()> {
    let mut harness = Harness::new();
    let source = harness.add_directory("project");
    let mut generator = FileGenerator::new(42);
    for i in 0..20 {
        write(&source, &format!("src/module_{i}.rs"), generator.text(50).as_bytes());
    }
    write(&source, "assets/logo.bin", &generator.content(16 * KB as usize));

    let engine = harness.engine();
    engine.sync("project")?;

    for round in 0..4 {
        write(
            &source,
            &format!("src/module_{}.rs", round * 3),
            generator.text(10).as_bytes(),
        );
        fs::remove_file(source.join(format!("src/module_{}.rs", 19 - round)))?;
        write(&source, &format!("docs/round_{round}.md"), b"# notes");
        assert_eq!(engine.sync("project")?.action, SyncAction::Incremental);
    }

    let dest = harness.path("restored");
    let report = engine.restore("project", &dest, ManifestSource::Remote)?;
    assert!(report.status.is_verified(), "{}", report.status);
    assert_eq!(report.artifacts_applied, 5);
    assert!(report.bytes_fetched > 0);
    assert_eq!(tree(&dest), tree(&source));
    Ok(())
}

#[test]
fn test_unchanged_source_is_a_noop() {
    let mut harness = Harness::new();
    let source = harness.add_directory("static");
    write(&source, "data.bin", &[9u8; 4096]);
    let engine = harness.engine();
    engine.sync("static").unwrap();

    let keys = harness.transport.keys();
    let manifest = harness.remote_manifest("static");
    for _ in 0..3 {
        let outcome = engine.sync("static").unwrap();
        assert_eq!(outcome.action, SyncAction::NoOp);
        assert!(outcome.artifact.is_none());
    }
    assert_eq!(harness.transport.keys(), keys);
    assert_eq!(harness.remote_manifest("static"), manifest);
}

#[test]
fn test_forced_consolidation_is_idempotent() {
    let mut harness = Harness::new();
    let source = harness.add_directory("docs");
    write(&source, "base.bin", &[1u8; 4096]);
    let engine = harness.engine();
    engine.sync("docs").unwrap();
    for i in 0..3 {
        write(&source, &format!("page-{i}.md"), b"page");
        engine.sync("docs").unwrap();
    }

    let once = engine.consolidate("docs").unwrap();
    assert_eq!(once.chain_length(), 1);
    let twice = engine.consolidate("docs").unwrap();
    assert_eq!(twice.chain_length(), 1);
    assert_eq!(twice.artifacts[0].range_end, once.artifacts[0].range_end);
    assert_eq!(twice.artifacts[0].checksum, once.artifacts[0].checksum);
    assert_eq!(twice.consolidation_history.len(), 2);

    // The next sync continues the consolidated chain
    write(&source, "after.md", b"after");
    let outcome = engine.sync("docs").unwrap();
    assert_eq!(outcome.action, SyncAction::Incremental);
    assert_eq!(outcome.chain_length, 2);

    let dest = harness.path("restored");
    assert!(engine
        .restore("docs", &dest, ManifestSource::Remote)
        .unwrap()
        .status
        .is_verified());
    assert_eq!(tree(&dest), tree(&source));
}

#[test]
fn test_age_threshold_sweep() {
    let mut harness = Harness::with_policy(KB, 100, Duration::from_secs(1));
    let source = harness.add_directory("aging");
    write(&source, "base.bin", &[5u8; 4096]);
    let engine = harness.engine();
    engine.sync("aging").unwrap();
    write(&source, "x.txt", b"x");
    engine.sync("aging").unwrap();

    std::thread::sleep(Duration::from_millis(1100));
    let report = engine.consolidate_due();
    assert_eq!(report.exit_code(), 0);
    let manifest = report.results[0].result.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(manifest.chain_length(), 1);
    assert_eq!(manifest.incremental_count, 0);
}

#[test]
fn test_exclude_change_mid_chain() {
    let mut harness = Harness::with_policy(KB, 2, Duration::from_secs(30 * 86400));
    let source = harness.add_directory("alpha");
    write(&source, "base.bin", &[7u8; 4096]);
    write(&source, "logs/app.log", b"verbose output");
    let engine = harness.engine();
    engine.sync("alpha").unwrap();
    for i in 0..2 {
        write(&source, &format!("note-{i}.txt"), b"note");
        assert_eq!(engine.sync("alpha").unwrap().action, SyncAction::Incremental);
    }
    let before = harness.remote_manifest("alpha");
    assert_eq!(before.incremental_count, 2);

    // The chain already holds files the new pattern excludes
    harness.config.targets[0].exclude = vec!["*.log".into()];
    let engine = harness.engine();
    write(&source, "after.txt", b"after");
    let outcome = engine.sync("alpha").unwrap();
    assert_eq!(outcome.action, SyncAction::Incremental);
    assert!(outcome.consolidated);
    assert_eq!(outcome.chain_length, 2);

    let manifest = harness.remote_manifest("alpha");
    assert_eq!(manifest.artifacts[0].range_end, before.last_marker);

    let dest = harness.path("restored");
    let report = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap();
    assert!(report.status.is_verified(), "{}", report.status);
    assert!(dest.join("logs").is_dir());
    assert!(!dest.join("logs/app.log").exists());

    let mut expected = tree(&source);
    expected.remove(std::path::Path::new("logs/app.log"));
    assert_eq!(tree(&dest), expected);
    assert_eq!(engine.sync("alpha").unwrap().action, SyncAction::NoOp);
}

#[test]
fn test_lost_state_directory_is_recovered_from_remote() {
    let mut harness = Harness::new();
    let source = harness.add_directory("laptop");
    write(&source, "base.bin", &[4u8; 4096]);
    let engine = harness.engine();
    engine.sync("laptop").unwrap();
    write(&source, "one.txt", b"1");
    engine.sync("laptop").unwrap();

    fs::remove_dir_all(harness.path("state")).unwrap();
    write(&source, "two.txt", b"2");
    let outcome = harness.engine().sync("laptop").unwrap();
    assert_eq!(outcome.action, SyncAction::Incremental);

    let dest = harness.path("restored");
    let report = engine.restore("laptop", &dest, ManifestSource::Local).unwrap();
    assert!(report.status.is_verified(), "{}", report.status);
    assert_eq!(tree(&dest), tree(&source));
}

#[test]
fn test_targets_are_independent() {
    let mut harness = Harness::new();
    let a = harness.add_directory("a");
    let b = harness.add_directory("b");
    write(&a, "a.txt", b"a");
    write(&b, "b.txt", b"b");
    let engine = harness.engine();

    let report = engine.sync_all(Some(2)).unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(harness.remote_manifest("a").chain_length(), 1);
    assert_eq!(harness.remote_manifest("b").chain_length(), 1);

    fs::remove_dir_all(&b).unwrap();
    write(&a, "a2.txt", b"a2");
    let report = engine.sync_all(Some(2)).unwrap();
    assert_eq!(report.exit_code(), 2);
    assert!(report.results[0].result.is_ok());
    assert!(report.results[1].result.is_err());
}

fn git(dir: &std::path::Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=chainback", "-c", "user.email=chainback@example.com"])
        .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn test_repository_chain_round_trip() {
    let mut harness = Harness::with_policy(0, 10, Duration::from_secs(86400));
    let repo = harness.path("sources/repo");
    fs::create_dir_all(&repo).unwrap();
    if !git(&repo, &["init", "-q"]) {
        eprintln!("git not available, skipping");
        return;
    }
    harness.config.targets.push(TargetConfig::repository("repo", &repo));
    let engine = harness.engine();

    write(&repo, "README.md", b"# repo");
    assert!(git(&repo, &["add", "-A"]));
    assert!(git(&repo, &["commit", "-q", "-m", "initial"]));
    assert_eq!(engine.sync("repo").unwrap().action, SyncAction::Full);

    for i in 0..3 {
        write(&repo, &format!("src/file_{i}.rs"), format!("// {i}").as_bytes());
        assert!(git(&repo, &["add", "-A"]));
        assert!(git(&repo, &["commit", "-q", "-m", &format!("change {i}")]));
        assert_eq!(engine.sync("repo").unwrap().action, SyncAction::Incremental);
    }
    assert!(git(&repo, &["tag", "v1"]));
    assert_eq!(engine.sync("repo").unwrap().action, SyncAction::NoOp);

    // Uncommitted edits are not part of the chain
    write(&repo, "scratch.txt", b"uncommitted");
    assert_eq!(engine.sync("repo").unwrap().action, SyncAction::NoOp);

    let dest = harness.path("repo-restore");
    let report = engine.restore("repo", &dest, ManifestSource::Remote).unwrap();
    assert!(report.status.is_verified(), "{}", report.status);
    assert_eq!(report.artifacts_applied, 4);
    assert_eq!(fs::read(dest.join("src/file_2.rs")).unwrap(), b"// 2");
    assert!(!dest.join("scratch.txt").exists());

    let consolidated = engine.consolidate("repo").unwrap();
    assert_eq!(consolidated.chain_length(), 1);
    assert!(engine
        .verify("repo", ManifestSource::Remote)
        .unwrap()
        .status
        .is_verified());
}
