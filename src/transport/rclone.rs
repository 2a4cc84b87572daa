use std::path::Path;
use std::process::Command;
use std::time::Duration;

use super::{BlobTransport, TransportError, TransportResult};
use crate::error::ChainError;
use crate::process::{self, CommandOutput};

/// Transport for any object store reachable through `rclone`
///
/// `remote` is an rclone path such as `s3:bucket/backups`. Exit codes follow
/// rclone's documented meanings: 3 and 4 mean the directory or file is
/// missing, 5 is a temporary error worth retrying.
#[derive(Debug, Clone)]
pub struct RcloneTransport {
    remote: String,
    binary: String,
    timeout: Duration,
}

impl RcloneTransport {
    /// Create a transport for `remote` using the given rclone binary
    pub fn new(remote: String, binary: String, timeout: Duration) -> Self {
        Self {
            remote: remote.trim_end_matches('/').to_string(),
            binary,
            timeout,
        }
    }

    fn remote_path(&self, key: &str) -> String {
        format!("{}/{}", self.remote, key)
    }

    fn invoke(&self, key: &str, args: &[&str]) -> TransportResult<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        process::run(&mut cmd, self.timeout).map_err(|err| match err {
            ChainError::Timeout { .. } => TransportError::Transient(format!("{key}: {err}")),
            ChainError::Io(io) => TransportError::Permanent(format!("cannot run {}: {io}", self.binary)),
            other => TransportError::Permanent(format!("{key}: {other}")),
        })
    }

    fn classify(key: &str, output: &CommandOutput) -> TransportError {
        let detail = format!("{key}: {}", output.stderr.trim());
        match output.code() {
            Some(3) | Some(4) => TransportError::NotFound(key.to_string()),
            Some(5) | Some(8) | None => TransportError::Transient(detail),
            _ => TransportError::Permanent(detail),
        }
    }
}

impl BlobTransport for RcloneTransport {
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let local = local.to_string_lossy();
        let target = self.remote_path(remote);
        let output = self.invoke(remote, &["copyto", local.as_ref(), &target])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::classify(remote, &output))
        }
    }

    fn get(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let local = local.to_string_lossy();
        let source = self.remote_path(remote);
        let output = self.invoke(remote, &["copyto", &source, local.as_ref()])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::classify(remote, &output))
        }
    }

    fn list(&self, prefix: &str) -> TransportResult<Vec<String>> {
        let dir = self.remote_path(prefix.trim_end_matches('/'));
        let output = self.invoke(prefix, &["lsf", "-R", "--files-only", &dir])?;
        if !output.status.success() {
            return match Self::classify(prefix, &output) {
                TransportError::NotFound(_) => Ok(Vec::new()),
                other => Err(other),
            };
        }
        let base = prefix.trim_end_matches('/');
        let mut keys: Vec<String> = output
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|name| if base.is_empty() { name.to_string() } else { format!("{base}/{name}") })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, remote: &str) -> TransportResult<()> {
        let target = self.remote_path(remote);
        let output = self.invoke(remote, &["deletefile", &target])?;
        if output.status.success() {
            return Ok(());
        }
        match Self::classify(remote, &output) {
            TransportError::NotFound(_) => Ok(()),
            other => Err(other),
        }
    }

    fn exists(&self, remote: &str) -> TransportResult<bool> {
        let target = self.remote_path(remote);
        let output = self.invoke(remote, &["lsf", "--files-only", &target])?;
        if output.status.success() {
            return Ok(!output.stdout.trim().is_empty());
        }
        match Self::classify(remote, &output) {
            TransportError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }
}
