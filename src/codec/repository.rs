use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use super::{Inspection, SnapshotCodec, SnapshotInfo, SnapshotMode};
use crate::error::{ChainError, Result};
use crate::manifest::Artifact;
use crate::process;
use crate::types::{ArtifactStats, SourceProbe, TargetKind};
use crate::utils;

/// Codec for git repositories
///
/// Artifacts are git bundles. The marker is the `HEAD` commit; an incremental
/// bundle carries everything reachable from `HEAD`, the branches and the tags
/// that is not reachable from the previous marker.
#[derive(Debug, Clone)]
pub struct RepositoryCodec {
    git: String,
    timeout: Duration,
}

impl RepositoryCodec {
    /// Create a codec driving `git` with a per-command time budget
    pub fn new(git: impl Into<String>, timeout: Duration) -> Self {
        Self {
            git: git.into(),
            timeout,
        }
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.arg("-C").arg(dir).env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = self.command(dir);
        cmd.args(args);
        process::run_checked(&mut cmd, self.timeout, dir)
    }

    /// Whether `git` exits successfully, without treating failure as an error
    fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<bool> {
        let mut cmd = self.command(dir);
        cmd.args(args);
        Ok(process::run(&mut cmd, self.timeout)?.status.success())
    }

    fn head(&self, dir: &Path) -> Result<String> {
        Ok(self.git(dir, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn revision_count(&self, dir: &Path) -> Result<u64> {
        let out = self.git(dir, &["rev-list", "--count", "HEAD", "--branches", "--tags"])?;
        out.trim()
            .parse()
            .map_err(|_| ChainError::codec(dir, format!("unexpected rev-list output {:?}", out.trim())))
    }

    fn stats(&self, dir: &Path) -> Result<ArtifactStats> {
        let tree = self.git(dir, &["ls-tree", "-r", "-l", "HEAD"])?;
        let mut file_count = 0;
        let mut total_bytes = 0;
        for line in tree.lines() {
            let mut fields = line.split_whitespace();
            let (_mode, kind, _object, size) = (fields.next(), fields.next(), fields.next(), fields.next());
            if kind == Some("blob") {
                file_count += 1;
                total_bytes += size.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            }
        }
        Ok(ArtifactStats {
            file_count,
            total_bytes,
            revision_count: Some(self.revision_count(dir)?),
            spot_checks: Vec::new(),
        })
    }

    /// Commit `HEAD` points to inside a bundle
    fn bundle_head(&self, blob: &Path, workdir: &Path) -> Result<String> {
        let blob_arg = blob.to_string_lossy();
        let heads = self.git(workdir, &["bundle", "list-heads", blob_arg.as_ref()])?;
        heads
            .lines()
            .find_map(|line| line.strip_suffix(" HEAD"))
            .map(|sha| sha.trim().to_string())
            .ok_or_else(|| ChainError::codec(blob, "bundle does not record HEAD"))
    }
}

impl SnapshotCodec for RepositoryCodec {
    fn target_kind(&self) -> TargetKind {
        TargetKind::Repository
    }

    fn extension(&self) -> &'static str {
        "bundle"
    }

    fn probe(&self, source: &Path) -> Result<SourceProbe> {
        let marker = self.head(source)?;
        let counts = self.git(source, &["count-objects", "-v"])?;
        let kib: u64 = counts
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                matches!(key.trim(), "size" | "size-pack")
                    .then(|| value.trim().parse::<u64>().ok())
                    .flatten()
            })
            .sum();
        Ok(SourceProbe {
            marker,
            size_bytes: kib * 1024,
        })
    }

    fn create(&self, source: &Path, mode: SnapshotMode<'_>, out: &Path) -> Result<SnapshotInfo> {
        let range_end = self.head(source)?;

        let exclusion = match mode {
            SnapshotMode::Full => None,
            SnapshotMode::Incremental { since } => {
                let commit = format!("{since}^{{commit}}");
                let reachable = self.git_ok(source, &["cat-file", "-e", &commit])?
                    && self.git_ok(source, &["merge-base", "--is-ancestor", since, "HEAD"])?;
                if !reachable {
                    // History was rewritten past the previous marker
                    return Err(ChainError::BaseStateMissing(since.to_string()));
                }
                Some(format!("^{since}"))
            }
        };

        let out_arg = out.to_string_lossy();
        // Single-threaded packing keeps bundles of identical history byte-identical
        let mut args = vec![
            "-c",
            "pack.threads=1",
            "bundle",
            "create",
            "-q",
            out_arg.as_ref(),
            "HEAD",
            "--branches",
            "--tags",
        ];
        if let Some(exclusion) = &exclusion {
            args.push(exclusion);
        }

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.git(source, &args)?;
        debug!(
            "Bundled {:?} at {} into {:?} ({})",
            source,
            range_end,
            out,
            utils::format_bytes(std::fs::metadata(out)?.len())
        );

        Ok(SnapshotInfo {
            stats: self.stats(source)?,
            range_end,
        })
    }

    fn apply(&self, blob: &Path, target: &Path) -> Result<()> {
        if !target.join(".git").exists() {
            if !utils::is_missing_or_empty(target)? {
                return Err(ChainError::codec(target, "not a repository and not empty"));
            }
            std::fs::create_dir_all(target)?;
            self.git(target, &["init", "-q"])?;
        }

        let blob_arg = blob.to_string_lossy();
        self.git(
            target,
            &[
                "fetch",
                "-q",
                "--update-head-ok",
                blob_arg.as_ref(),
                "+refs/heads/*:refs/heads/*",
                "+refs/tags/*:refs/tags/*",
            ],
        )?;

        let head = self.bundle_head(blob, target)?;
        let branches = self.git(
            target,
            &["for-each-ref", "--points-at", &head, "--format=%(refname)", "refs/heads"],
        )?;
        match branches.lines().next() {
            Some(branch) => {
                self.git(target, &["symbolic-ref", "HEAD", branch.trim()])?;
            }
            None => {
                self.git(target, &["update-ref", "--no-deref", "HEAD", &head])?;
            }
        }
        self.git(target, &["reset", "-q", "--hard", &head])?;
        Ok(())
    }

    fn inspect(&self, target: &Path, expected: &Artifact) -> Result<Inspection> {
        let mut inspection = Inspection::default();

        let fsck = {
            let mut cmd = self.command(target);
            cmd.args(["fsck", "--no-progress", "--full"]);
            process::run(&mut cmd, self.timeout)?
        };
        inspection.check(fsck.status.success(), || {
            format!("git fsck failed: {}", fsck.stderr.trim())
        });

        let head = self.head(target)?;
        inspection.check(head == expected.range_end, || {
            format!("HEAD is {} but the chain ends at {}", head, expected.range_end)
        });

        if let Some(recorded) = expected.stats.revision_count {
            let restored = self.revision_count(target)?;
            // Branches deleted at the source are kept by incremental fetches
            inspection.check(restored >= recorded, || {
                format!("{} revisions restored, chain covers {}", restored, recorded)
            });
        }

        let status = self.git(target, &["status", "--porcelain"])?;
        inspection.check(status.trim().is_empty(), || "working tree differs from HEAD".to_string());
        Ok(inspection)
    }
}
