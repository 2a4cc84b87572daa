//! Running external tools with a bounded time budget
//!
//! The repository codec and the rclone transport shell out to `git` and
//! `rclone`. Both are blocking calls that can hang on a stuck remote or a
//! huge repository, so every invocation carries a deadline; on expiry the
//! child is killed and [`ChainError::Timeout`] is returned.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{ChainError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit status
    pub status: ExitStatus,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

fn describe(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run `cmd` to completion or until `timeout` elapses
///
/// Output is captured on background threads so a chatty child cannot block
/// on a full pipe while we wait for it.
pub fn run(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput> {
    let line = describe(cmd);
    debug!("Running `{}` (timeout {:?})", line, timeout);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("`{}` exceeded {:?}, killing", line, timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(ChainError::Timeout {
                command: line,
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    trace!("`{}` exited with {:?}", line, output.status.code());
    Ok(output)
}

/// Run `cmd` and treat a non-zero exit as a codec failure on `context`
pub fn run_checked(cmd: &mut Command, timeout: Duration, context: &std::path::Path) -> Result<String> {
    let line = describe(cmd);
    let output = run(cmd, timeout)?;
    if !output.status.success() {
        return Err(ChainError::codec(
            context,
            format!(
                "`{}` failed with {}: {}",
                line,
                output.status,
                output.stderr.trim()
            ),
        ));
    }
    Ok(output.stdout)
}
