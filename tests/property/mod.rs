//! Property-based testing for chainback
//!
//! Uses proptest to drive random edit sequences through sync and checks the
//! chain invariants and the restore round trip after every step.

use ::chainback::*;
use proptest::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{tree, write, Harness};

/// One edit applied to the source between syncs
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
    CreateDir { path: PathBuf },
    RemoveDir { path: PathBuf },
}

/// Directory names never contain a dot, file names always do
fn dir_strategy() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec("[a-c]", 1..=3).prop_map(|dirs| dirs.into_iter().collect())
}

fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (
        prop::collection::vec("[a-c]", 0..=2),
        "[a-e]{1,3}\\.(txt|bin)",
    )
        .prop_map(|(dirs, file)| {
            let mut path: PathBuf = dirs.into_iter().collect();
            path.push(file);
            path
        })
}

fn file_operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        6 => (path_strategy(), prop::collection::vec(any::<u8>(), 0..512))
            .prop_map(|(path, content)| FileOperation::Write { path, content }),
        2 => path_strategy().prop_map(|path| FileOperation::Delete { path }),
        2 => dir_strategy().prop_map(|path| FileOperation::CreateDir { path }),
        1 => dir_strategy().prop_map(|path| FileOperation::RemoveDir { path }),
    ]
}

fn apply(root: &Path, op: &FileOperation) {
    match op {
        FileOperation::Write { path, content } => write(root, &path.to_string_lossy(), content),
        FileOperation::Delete { path } => {
            let _ = fs::remove_file(root.join(path));
        }
        FileOperation::CreateDir { path } => fs::create_dir_all(root.join(path)).unwrap(),
        FileOperation::RemoveDir { path } => {
            let _ = fs::remove_dir_all(root.join(path));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Every committed chain restores to the source as it was at that sync
    #[test]
    fn prop_every_sync_restores(
        rounds in prop::collection::vec(prop::collection::vec(file_operation_strategy(), 0..6), 1..6),
        threshold in prop_oneof![Just(0u64), Just(600u64), Just(1u64 << 30)],
    ) {
        let mut harness = Harness::with_policy(threshold, 3, Duration::from_secs(86400));
        let source = harness.add_directory("prop");
        let engine = harness.engine();

        for (i, round) in rounds.iter().enumerate() {
            for op in round {
                apply(&source, op);
            }
            let outcome = engine.sync("prop").unwrap();
            let manifest = harness.remote_manifest("prop");

            prop_assert!(manifest.validate().is_ok());
            prop_assert_eq!(manifest.chain_length(), outcome.chain_length);
            prop_assert_eq!(manifest.incremental_count as usize, manifest.chain_length() - 1);
            prop_assert!(manifest.incremental_count <= 3);
            prop_assert_eq!(harness.live("prop").len(), manifest.chain_length());

            let dest = harness.path(&format!("restore-{i}"));
            let report = engine.restore("prop", &dest, ManifestSource::Remote).unwrap();
            prop_assert!(report.status.is_verified(), "{}", report.status);
            prop_assert_eq!(tree(&dest), tree(&source));
        }
    }

    /// Syncing an unchanged source never changes the committed chain
    #[test]
    fn prop_repeat_sync_is_stable(
        ops in prop::collection::vec(file_operation_strategy(), 1..8),
        repeats in 1usize..4,
    ) {
        let mut harness = Harness::new();
        let source = harness.add_directory("stable");
        for op in &ops {
            apply(&source, op);
        }
        let engine = harness.engine();
        engine.sync("stable").unwrap();
        let committed = harness.remote_manifest("stable");

        for _ in 0..repeats {
            prop_assert_eq!(engine.sync("stable").unwrap().action, SyncAction::NoOp);
        }
        prop_assert_eq!(harness.remote_manifest("stable"), committed);
    }
}
