use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::{BlobTransport, TransportResult};
use crate::config::RetryConfig;

/// Wraps a transport and retries transient failures with exponential backoff
///
/// `NotFound` and permanent failures are returned on the first attempt.
pub struct RetryingTransport {
    inner: Box<dyn BlobTransport>,
    retry: RetryConfig,
}

impl RetryingTransport {
    /// Wrap `inner` with the given retry policy
    pub fn new(inner: Box<dyn BlobTransport>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    /// Delay before retry number `attempt` (zero-based), with ±25% jitter
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self
            .retry
            .retry_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry.retry_max_delay_ms);
        if base < 4 {
            return Duration::from_millis(base);
        }
        let jitter = rand::random::<u64>() % (base / 2);
        Duration::from_millis(base - base / 4 + jitter)
    }

    fn run<T>(&self, op: &str, key: &str, mut call: impl FnMut() -> TransportResult<T>) -> TransportResult<T> {
        let mut attempt = 0;
        loop {
            match call() {
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    debug!(
                        op,
                        key,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient transport failure, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(op, key, attempts = attempt + 1, "giving up after transient failures");
                    }
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }
}

impl BlobTransport for RetryingTransport {
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()> {
        self.run("put", remote, || self.inner.put(remote, local))
    }

    fn get(&self, remote: &str, local: &Path) -> TransportResult<()> {
        self.run("get", remote, || self.inner.get(remote, local))
    }

    fn list(&self, prefix: &str) -> TransportResult<Vec<String>> {
        self.run("list", prefix, || self.inner.list(prefix))
    }

    fn delete(&self, remote: &str) -> TransportResult<()> {
        self.run("delete", remote, || self.inner.delete(remote))
    }

    fn exists(&self, remote: &str) -> TransportResult<bool> {
        self.run("exists", remote, || self.inner.exists(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::Operation;
    use crate::transport::{MemoryTransport, TransportError};

    fn quick_retry(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn test_retries_transient_until_success() {
        let memory = MemoryTransport::new();
        memory.fail_next(Operation::Exists, None, TransportError::Transient("503".into()));
        memory.fail_next(Operation::Exists, None, TransportError::Transient("503".into()));
        let transport = RetryingTransport::new(Box::new(memory.clone()), quick_retry(3));

        assert!(!transport.exists("k").unwrap());
        assert_eq!(memory.calls(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let memory = MemoryTransport::new();
        for _ in 0..3 {
            memory.fail_next(Operation::List, None, TransportError::Transient("reset".into()));
        }
        let transport = RetryingTransport::new(Box::new(memory.clone()), quick_retry(2));

        assert!(transport.list("").unwrap_err().is_transient());
        assert_eq!(memory.calls(), 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let memory = MemoryTransport::new();
        memory.fail_next(Operation::Delete, None, TransportError::Permanent("denied".into()));
        let transport = RetryingTransport::new(Box::new(memory.clone()), quick_retry(5));

        assert_eq!(
            transport.delete("k").unwrap_err(),
            TransportError::Permanent("denied".into())
        );
        assert_eq!(memory.calls(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let transport = RetryingTransport::new(
            Box::new(MemoryTransport::new()),
            RetryConfig {
                max_retries: 10,
                retry_delay_ms: 100,
                retry_max_delay_ms: 1000,
            },
        );
        for attempt in 0..10 {
            assert!(transport.backoff(attempt) <= Duration::from_millis(1250));
        }
    }
}
