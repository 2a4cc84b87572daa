use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use super::{BlobTransport, TransportError, TransportResult};
use crate::utils::path_to_key;

/// Transport backed by a local (or mounted) directory
///
/// Used for NAS mounts, removable drives and tests. Uploads are written to a
/// temporary file next to the destination and renamed into place so a
/// concurrent reader never sees a partial blob.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a transport rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>) -> crate::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    /// Root directory of the remote namespace
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject keys that could escape the root
    fn validate_key(key: &str) -> TransportResult<()> {
        if key.is_empty() {
            return Err(TransportError::Permanent("unsafe key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') || key.contains('\\') {
            return Err(TransportError::Permanent(format!("unsafe key: '{key}'")));
        }
        if Path::new(key).components().any(|c| c == Component::ParentDir) {
            return Err(TransportError::Permanent(format!("unsafe key: parent traversal '{key}'")));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> TransportResult<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    keys.push(path_to_key(rel));
                }
            }
        }
        Ok(())
    }
}

impl BlobTransport for LocalTransport {
    fn put(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let path = self.resolve(remote)?;
        let data = fs::read(local).map_err(|e| TransportError::Permanent(format!("{local:?}: {e}")))?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| TransportError::from_io(remote, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| TransportError::from_io(remote, e))?;
        tmp.write_all(&data).map_err(|e| TransportError::from_io(remote, e))?;
        tmp.as_file().sync_all().map_err(|e| TransportError::from_io(remote, e))?;
        tmp.persist(&path)
            .map_err(|e| TransportError::from_io(remote, e.error))?;

        trace!("put {} ({} bytes)", remote, data.len());
        Ok(())
    }

    fn get(&self, remote: &str, local: &Path) -> TransportResult<()> {
        let path = self.resolve(remote)?;
        if !path.is_file() {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| TransportError::Permanent(format!("{parent:?}: {e}")))?;
        }
        fs::copy(&path, local).map_err(|e| TransportError::from_io(remote, e))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> TransportResult<Vec<String>> {
        // Prefixes name directories here; a trailing slash is optional.
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        let mut keys = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                self.list_recursive(&dir, &mut keys)
                    .map_err(|e| TransportError::from_io(prefix, e))?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransportError::from_io(prefix, e)),
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, remote: &str) -> TransportResult<()> {
        let path = self.resolve(remote)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::from_io(remote, e)),
        }
    }

    fn exists(&self, remote: &str) -> TransportResult<bool> {
        let path = self.resolve(remote)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransportError::from_io(remote, e)),
        }
    }
}
