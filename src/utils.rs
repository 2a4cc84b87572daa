//! Utility functions for chainback
//!
//! Hashing helpers, durable file writes, path keys, permission handling and formatting
//! used by the manifest store, the codecs and the CLI.

use crate::error::Result;
#[cfg(not(unix))]
use crate::error::ChainError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Hash a file's content using SHA-256
///
/// Reads the file through an 8KB buffer and returns the digest as a
/// 64-character lowercase hex string.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Durable atomic file write
///
/// Writes to a temporary file in the destination directory, fsyncs it and
/// renames it over `path`. Readers see either the previous content or the
/// new content, never a partial file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Compact UTC timestamp used in artifact and archive names
///
/// Produces `YYYYMMDDTHHMMSSZ`, which sorts lexicographically in time order.
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Check whether a directory is missing or has no entries
pub fn is_missing_or_empty(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Convert a relative path to a `/`-separated key
pub fn path_to_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Raw bytes of an OS string, exactly as the filesystem holds them
#[cfg(unix)]
pub fn os_bytes(name: &OsStr) -> Result<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Ok(name.as_bytes())
}

/// Raw bytes of an OS string (non-unix implementation)
///
/// Names that are not valid Unicode cannot be represented portably.
#[cfg(not(unix))]
pub fn os_bytes(name: &OsStr) -> Result<&[u8]> {
    name.to_str()
        .map(str::as_bytes)
        .ok_or_else(|| ChainError::codec(Path::new(name), "filename is not valid Unicode"))
}

/// OS string for raw bytes produced by [`os_bytes`]
#[cfg(unix)]
pub fn os_from_bytes(bytes: &[u8]) -> &OsStr {
    use std::os::unix::ffi::OsStrExt;
    OsStr::from_bytes(bytes)
}

/// OS string for raw bytes produced by [`os_bytes`] (non-unix implementation)
#[cfg(not(unix))]
pub fn os_from_bytes(bytes: &[u8]) -> &OsStr {
    OsStr::new(std::str::from_utf8(bytes).unwrap_or_default())
}

/// Convert a relative path to a `/`-separated key of raw name bytes
///
/// Unlike [`path_to_key`] this keeps names that are not valid UTF-8 intact.
pub fn path_to_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut key = Vec::new();
    for component in path.components() {
        if !key.is_empty() {
            key.push(b'/');
        }
        key.extend_from_slice(os_bytes(component.as_os_str())?);
    }
    Ok(key)
}

/// Relative path for a key produced by [`path_to_bytes`]
pub fn path_from_bytes(key: &[u8]) -> PathBuf {
    key.split(|b| *b == b'/')
        .filter(|part| !part.is_empty())
        .map(os_from_bytes)
        .collect()
}

/// Get Unix permissions from metadata
#[cfg(unix)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
#[cfg(windows)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the read-only attribute can be expressed.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly((mode & 0o200) == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}
