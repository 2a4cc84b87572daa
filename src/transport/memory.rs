use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::{BlobTransport, TransportError, TransportResult};

/// Operation kinds a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Upload
    Put,
    /// Download
    Get,
    /// Listing
    List,
    /// Deletion
    Delete,
    /// Existence probe
    Exists,
}

#[derive(Debug, Default)]
struct State {
    blobs: BTreeMap<String, Vec<u8>>,
    faults: VecDeque<(Operation, Option<String>, TransportError)>,
    calls: usize,
}

/// In-memory transport for drills and tests
///
/// Cloning shares the same store. Faults queued with [`MemoryTransport::fail_next`]
/// fire once on the next matching call, in order.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call of `op`, optionally restricted to
    /// keys starting with `key_prefix`
    pub fn fail_next(&self, op: Operation, key_prefix: Option<&str>, err: TransportError) {
        self.state
            .lock()
            .faults
            .push_back((op, key_prefix.map(str::to_string), err));
    }

    /// Raw bytes of a stored blob
    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(key).cloned()
    }

    /// Overwrite a stored blob with arbitrary bytes
    pub fn corrupt(&self, key: &str, bytes: Vec<u8>) {
        self.state.lock().blobs.insert(key.to_string(), bytes);
    }

    /// Remove a blob without going through the fault queue
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().blobs.remove(key)
    }

    /// Every stored key, sorted
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().blobs.keys().cloned().collect()
    }

    /// Total number of calls served (including failed ones)
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    fn check_fault(state: &mut State, op: Operation, key: &str) -> TransportResult<()> {
        state.calls += 1;
        let hit = state.faults.iter().position(|(fault_op, prefix, _)| {
            *fault_op == op && prefix.as_deref().map_or(true, |p| key.starts_with(p))
        });
        match hit.and_then(|idx| state.faults.remove(idx)) {
            Some((_, _, err)) => Err(err),
            None => Ok(()),
        }
    }
}

impl BlobTransport for MemoryTransport {
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let data = fs::read(local).map_err(|e| TransportError::Permanent(format!("{local:?}: {e}")))?;
        let mut state = self.state.lock();
        Self::check_fault(&mut state, Operation::Put, remote)?;
        state.blobs.insert(remote.to_string(), data);
        Ok(())
    }

    fn get(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let data = {
            let mut state = self.state.lock();
            Self::check_fault(&mut state, Operation::Get, remote)?;
            state
                .blobs
                .get(remote)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(remote.to_string()))?
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| TransportError::Permanent(e.to_string()))?;
        }
        fs::write(local, data).map_err(|e| TransportError::Permanent(format!("{local:?}: {e}")))
    }

    fn list(&self, prefix: &str) -> TransportResult<Vec<String>> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, Operation::List, prefix)?;
        Ok(state
            .blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, remote: &str) -> TransportResult<()> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, Operation::Delete, remote)?;
        state.blobs.remove(remote);
        Ok(())
    }

    fn exists(&self, remote: &str) -> TransportResult<bool> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, Operation::Exists, remote)?;
        Ok(state.blobs.contains_key(remote))
    }
}
