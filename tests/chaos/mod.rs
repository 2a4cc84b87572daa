//! Chaos testing for chainback
//!
//! Damages the remote (missing, corrupted and tampered artifacts), injects
//! transport failures and contends for target locks, then checks that
//! nothing is committed half-way and that restore names what went wrong.

use ::chainback::lock::TargetLock;
use ::chainback::transport::RetryingTransport;
use ::chainback::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_test::traced_test;

use crate::{tree, write, Harness};

/// A harness holding a full artifact plus `incrementals` incrementals
fn chain(name: &str, incrementals: usize) -> (Harness, PathBuf) {
    let mut harness = Harness::new();
    let source = harness.add_directory(name);
    write(&source, "base.bin", &[8u8; 4096]);
    let engine = harness.engine();
    engine.sync(name).unwrap();
    for i in 0..incrementals {
        write(&source, &format!("step-{i}.txt"), format!("step {i}").as_bytes());
        assert_eq!(engine.sync(name).unwrap().action, SyncAction::Incremental);
    }
    (harness, source)
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        retry_delay_ms: 1,
        retry_max_delay_ms: 5,
    }
}

#[test]
fn test_missing_artifact_reports_incomplete_chain() {
    let (harness, _) = chain("alpha", 3);
    let manifest = harness.remote_manifest("alpha");
    let victim = &manifest.artifacts[2].filename;
    harness.transport.remove(&format!("alpha/chain/{victim}")).unwrap();

    let report = harness
        .engine()
        .restore("alpha", &harness.path("out"), ManifestSource::Remote)
        .unwrap();
    assert_eq!(
        report.status,
        RestoreStatus::IncompleteChain {
            position: 2,
            filename: victim.clone(),
        }
    );
    assert_eq!(report.status.exit_code(), 5);
    assert_eq!(report.artifacts_applied, 0);
}

#[test]
fn test_corrupted_artifact_reports_checksum_mismatch() {
    let (harness, _) = chain("alpha", 4);
    let manifest = harness.remote_manifest("alpha");

    let mut rng = StdRng::seed_from_u64(7);
    let position = rng.random_range(0..manifest.chain_length());
    let victim = &manifest.artifacts[position];
    let key = format!("alpha/chain/{}", victim.filename);
    let mut bytes = harness.transport.blob(&key).unwrap();
    let offset = rng.random_range(0..bytes.len());
    bytes[offset] ^= 0xff;
    harness.transport.corrupt(&key, bytes);
    info!("Corrupted artifact #{} at byte {}", position, offset);

    let report = harness.engine().verify("alpha", ManifestSource::Remote).unwrap();
    match &report.status {
        RestoreStatus::ChecksumMismatch {
            position: reported,
            filename,
            expected,
            actual,
        } => {
            assert_eq!(*reported, position);
            assert_eq!(filename, &victim.filename);
            assert_eq!(expected, &victim.checksum);
            assert_ne!(actual, expected);
        }
        other => panic!("expected a checksum mismatch, got {other}"),
    }
    assert_eq!(report.status.exit_code(), 3);
}

#[test]
fn test_tampered_manifest_fails_structural_checks() {
    let (harness, _) = chain("alpha", 2);
    let mut manifest = harness.remote_manifest("alpha");
    if let Some(tail) = manifest.artifacts.last_mut() {
        tail.stats.file_count += 1;
    }
    let tampered = harness.path("tampered.json");
    std::fs::write(&tampered, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    harness.transport.put("alpha/manifest.json", &tampered).unwrap();

    let report = harness
        .engine()
        .restore("alpha", &harness.path("out"), ManifestSource::Remote)
        .unwrap();
    assert!(
        matches!(report.status, RestoreStatus::StructuralFailure { .. }),
        "{}",
        report.status
    );
    assert_eq!(report.status.exit_code(), 4);
    assert_eq!(report.artifacts_applied, 3);
}

#[test]
#[traced_test]
fn test_transient_failures_are_retried() {
    let mut harness = Harness::new();
    let source = harness.add_directory("flaky");
    write(&source, "data.bin", &[1u8; 4096]);

    for _ in 0..2 {
        harness.transport.fail_next(
            TransportOperation::Put,
            Some("flaky/chain/"),
            TransportError::Transient("connection reset".into()),
        );
    }
    harness.transport.fail_next(
        TransportOperation::Get,
        Some("flaky/manifest.json"),
        TransportError::Transient("throttled".into()),
    );

    let retrying = RetryingTransport::new(Box::new(harness.transport.clone()), quick_retry());
    let engine = ChainEngineBuilder::new(harness.config.clone())
        .transport(Arc::new(retrying))
        .build()
        .unwrap();

    assert_eq!(engine.sync("flaky").unwrap().action, SyncAction::Full);
    assert_eq!(harness.live("flaky").len(), 1);
    assert!(engine
        .verify("flaky", ManifestSource::Remote)
        .unwrap()
        .status
        .is_verified());
}

#[test]
fn test_permanent_failure_commits_nothing_remotely() {
    let (harness, source) = chain("alpha", 1);
    let committed = harness.remote_manifest("alpha");

    write(&source, "late.txt", b"late");
    harness.transport.fail_next(
        TransportOperation::Put,
        Some("alpha/chain/"),
        TransportError::Permanent("access denied".into()),
    );
    let engine = harness.engine();
    let err = engine.sync("alpha").unwrap_err();
    assert!(matches!(err, ChainError::Transport(TransportError::Permanent(_))));
    assert!(!err.is_transient());
    assert_eq!(harness.remote_manifest("alpha"), committed);

    // The remote still restores the previous chain
    assert!(engine
        .verify("alpha", ManifestSource::Remote)
        .unwrap()
        .status
        .is_verified());

    // The next sync finishes the upload before anything else
    let outcome = engine.sync("alpha").unwrap();
    assert_eq!(outcome.action, SyncAction::NoOp);
    assert_eq!(harness.remote_manifest("alpha").chain_length(), 3);

    let dest = harness.path("out");
    let report = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap();
    assert!(report.status.is_verified());
    assert_eq!(tree(&dest), tree(&source));
}

#[test]
fn test_failed_consolidation_leaves_chain_intact() {
    let (harness, _) = chain("alpha", 3);
    let committed = harness.remote_manifest("alpha");
    let live = harness.live("alpha");

    harness.transport.fail_next(
        TransportOperation::Put,
        Some("alpha/archive/"),
        TransportError::Permanent("bucket is read-only".into()),
    );
    let engine = harness.engine();
    let err = engine.consolidate("alpha").unwrap_err();
    assert!(matches!(err, ChainError::ConsolidationFailed { .. }), "{err}");

    assert_eq!(harness.remote_manifest("alpha"), committed);
    assert_eq!(harness.live("alpha"), live);
    assert_eq!(harness.engine().store().load("alpha").unwrap().unwrap(), committed);

    let retried = engine.consolidate("alpha").unwrap();
    assert_eq!(retried.chain_length(), 1);
}

#[test]
fn test_sync_after_failed_consolidation() {
    let mut harness = Harness::with_policy(1024, 2, std::time::Duration::from_secs(30 * 86400));
    let source = harness.add_directory("alpha");
    write(&source, "base.bin", &[8u8; 4096]);
    let engine = harness.engine();
    engine.sync("alpha").unwrap();
    for i in 0..2 {
        write(&source, &format!("step-{i}.txt"), b"step");
        engine.sync("alpha").unwrap();
    }
    let committed = harness.remote_manifest("alpha");

    write(&source, "blocked.txt", b"blocked");
    harness.transport.fail_next(
        TransportOperation::Put,
        Some("alpha/archive/"),
        TransportError::Permanent("bucket is read-only".into()),
    );
    let err = engine.sync("alpha").unwrap_err();
    assert!(matches!(err, ChainError::ConsolidationFailed { .. }), "{err}");
    assert_eq!(harness.remote_manifest("alpha"), committed);
    assert_eq!(harness.live("alpha").len(), 3);

    let outcome = engine.sync("alpha").unwrap();
    assert_eq!(outcome.action, SyncAction::Incremental);
    assert!(outcome.consolidated);
    assert_eq!(outcome.chain_length, 2);

    let dest = harness.path("out");
    let report = engine.restore("alpha", &dest, ManifestSource::Remote).unwrap();
    assert!(report.status.is_verified(), "{}", report.status);
    assert_eq!(tree(&dest), tree(&source));
}

#[test]
fn test_unreferenced_blobs_are_removed() {
    let (harness, source) = chain("alpha", 1);
    let stray = harness.path("stray.snap");
    std::fs::write(&stray, b"left over by an interrupted run").unwrap();
    harness.transport.put("alpha/chain/full-stray.snap", &stray).unwrap();

    write(&source, "next.txt", b"next");
    harness.engine().sync("alpha").unwrap();
    let live = harness.live("alpha");
    assert_eq!(live.len(), 3);
    assert!(!live.iter().any(|k| k.ends_with("full-stray.snap")));
}

#[test]
fn test_locked_target_is_refused() {
    let (harness, source) = chain("alpha", 0);
    let engine = harness.engine();
    let lock = TargetLock::acquire(&engine.store().lock_path("alpha"), "alpha").unwrap();

    write(&source, "blocked.txt", b"blocked");
    let err = engine.sync("alpha").unwrap_err();
    assert!(matches!(err, ChainError::TargetLocked(_)));
    assert!(err.is_transient());
    assert!(matches!(engine.consolidate("alpha"), Err(ChainError::TargetLocked(_))));

    // Restoring from the remote manifest does not need the lock
    assert!(engine
        .verify("alpha", ManifestSource::Remote)
        .unwrap()
        .status
        .is_verified());

    drop(lock);
    assert_eq!(engine.sync("alpha").unwrap().action, SyncAction::Incremental);
}
