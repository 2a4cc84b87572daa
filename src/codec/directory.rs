use globset::{Glob, GlobSet, GlobSetBuilder};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::{Inspection, SnapshotCodec, SnapshotInfo, SnapshotMode};
use crate::error::{ChainError, Result};
use crate::manifest::Artifact;
use crate::types::{ArtifactStats, SourceProbe, SpotCheck, TargetKind};
use crate::utils;

const MAGIC: &[u8; 4] = b"CHBK";
const FORMAT_VERSION: u8 = 2;
const INDEX_EXTENSION: &str = "idx";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::File => b'f',
            EntryKind::Dir => b'd',
            EntryKind::Symlink => b'l',
        }
    }
}

/// One entry as seen by a scan
///
/// `path` holds the raw name bytes joined with `/`. Directories carry no
/// hash, size or mode; a symlink's hash covers its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    path: Vec<u8>,
    kind: EntryKind,
    hash: String,
    size: u64,
    mode: u32,
}

/// Leading record of a `.snap` blob
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    /// Marker the blob applies on top of; `None` for full blobs
    base: Option<String>,
    marker: String,
    /// Complete index at `marker`
    index: Vec<IndexEntry>,
    deleted: Vec<Vec<u8>>,
    /// Number of entry records following the header
    packed: u64,
}

/// Precedes the raw bytes of one packed entry
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    path: Vec<u8>,
    kind: EntryKind,
    len: u64,
}

/// Codec for plain directory trees
///
/// Scans regular files, directories and (on unix) symlinks without following
/// them, hashes file content in parallel and derives the marker from the
/// sorted index. The index at each produced marker is cached in the codec
/// state directory so the next incremental can diff against it; only the
/// indexes at the base and at the newest marker are kept.
///
/// Blobs are a single lz4 frame stream: a header with the index followed by
/// one record per packed entry. File content is streamed in fixed-size chunks
/// in both directions.
#[derive(Debug)]
pub struct DirectoryCodec {
    state_dir: PathBuf,
    excludes: GlobSet,
    spot_checks: usize,
}

impl DirectoryCodec {
    /// Create a codec keeping its indexes in `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>, exclude: &[String], spot_checks: usize) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            state_dir: state_dir.into(),
            excludes: builder.build()?,
            spot_checks,
        })
    }

    fn index_path(&self, marker: &str) -> PathBuf {
        self.state_dir.join(format!("{marker}.{INDEX_EXTENSION}"))
    }

    fn load_index(&self, marker: &str) -> Result<Option<Vec<IndexEntry>>> {
        let bytes = match fs::read(self.index_path(marker)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (index, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(index))
    }

    fn store_index(&self, marker: &str, index: &[IndexEntry]) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(index, bincode::config::standard())?;
        utils::atomic_write(&self.index_path(marker), &bytes)
    }

    /// Drop cached indexes for markers other than `keep`
    fn prune_indexes(&self, keep: &[&str]) -> Result<()> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXTENSION) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if !keep.contains(&stem) {
                trace!("Pruning index {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn scan(&self, root: &Path, excludes: Option<&GlobSet>) -> Result<Vec<IndexEntry>> {
        if !root.is_dir() {
            return Err(ChainError::codec(root, "not a directory"));
        }
        let start = Instant::now();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !excludes.is_some_and(|set| is_excluded(set, root, entry.path()))
            });

        let mut found = Vec::new();
        for entry in walker {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            let file_type = entry.file_type();
            let kind = if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() && cfg!(unix) {
                EntryKind::Symlink
            } else {
                debug!("Skipping {:?}: unsupported file type", entry.path());
                continue;
            };
            found.push((entry.into_path(), kind));
        }

        let mut index = found
            .par_iter()
            .map(|(path, kind)| index_entry(root, path, *kind))
            .collect::<Result<Vec<_>>>()?;
        index.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Scanned {} entries ({}) under {:?} in {:?}",
            index.len(),
            utils::format_bytes(total_size(&index)),
            root,
            start.elapsed()
        );
        Ok(index)
    }

    fn stats(&self, index: &[IndexEntry]) -> ArtifactStats {
        let files: Vec<(&str, &IndexEntry)> = index
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .filter_map(|e| std::str::from_utf8(&e.path).ok().map(|path| (path, e)))
            .collect();
        let samples = self.spot_checks.min(files.len());
        let spot_checks = (0..samples)
            .map(|i| files[i * files.len() / samples])
            .map(|(path, e)| SpotCheck {
                path: path.to_string(),
                checksum: e.hash.clone(),
            })
            .collect();
        ArtifactStats {
            file_count: entry_count(index),
            total_bytes: total_size(index),
            revision_count: None,
            spot_checks,
        }
    }

    /// Scan `source`, write the blob and cache the new index
    fn snapshot(
        &self,
        source: &Path,
        mode: SnapshotMode<'_>,
        out: &Path,
        excludes: Option<&GlobSet>,
    ) -> Result<SnapshotInfo> {
        let index = self.scan(source, excludes)?;
        let marker = index_marker(&index);

        let (base, packed, deleted): (Option<&str>, Vec<usize>, Vec<Vec<u8>>) = match mode {
            SnapshotMode::Full => (None, (0..index.len()).collect(), Vec::new()),
            SnapshotMode::Incremental { since } => {
                let base_index = self
                    .load_index(since)?
                    .ok_or_else(|| ChainError::BaseStateMissing(since.to_string()))?;
                let previous: HashMap<&[u8], &IndexEntry> =
                    base_index.iter().map(|e| (e.path.as_slice(), e)).collect();
                let current: BTreeSet<&[u8]> = index.iter().map(|e| e.path.as_slice()).collect();
                let packed = index
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| previous.get(e.path.as_slice()).copied() != Some(*e))
                    .map(|(i, _)| i)
                    .collect();
                let deleted = base_index
                    .iter()
                    .filter(|e| !current.contains(e.path.as_slice()))
                    .map(|e| e.path.clone())
                    .collect();
                (Some(since), packed, deleted)
            }
        };

        let header = Header {
            base: base.map(str::to_string),
            marker: marker.clone(),
            index,
            deleted,
            packed: packed.len() as u64,
        };
        let entries: Vec<&IndexEntry> = packed.iter().map(|&i| &header.index[i]).collect();
        let size = write_blob(out, &header, source, &entries)?;
        debug!(
            "Wrote {} snapshot {:?}: {} entries packed, {} deleted, {}",
            if base.is_some() { "incremental" } else { "full" },
            out,
            header.packed,
            header.deleted.len(),
            utils::format_bytes(size)
        );

        self.store_index(&marker, &header.index)?;
        let mut keep = vec![marker.as_str()];
        keep.extend(base);
        self.prune_indexes(&keep)?;

        Ok(SnapshotInfo {
            range_end: marker.clone(),
            stats: self.stats(&header.index),
        })
    }
}

fn is_excluded(set: &GlobSet, root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    set.is_match(relative) || path.file_name().is_some_and(|name| set.is_match(name))
}

fn index_entry(root: &Path, path: &Path, kind: EntryKind) -> Result<IndexEntry> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ChainError::internal(format!("{:?} is outside {:?}", path, root)))?;
    let (hash, size, mode) = match kind {
        EntryKind::File => {
            let metadata = fs::symlink_metadata(path)?;
            (
                utils::hash_file_content(path)?,
                metadata.len(),
                utils::get_permissions(&metadata),
            )
        }
        EntryKind::Dir => (String::new(), 0, 0),
        EntryKind::Symlink => (utils::hash_data(&link_target(path)?), 0, 0),
    };
    Ok(IndexEntry {
        path: utils::path_to_bytes(relative)?,
        kind,
        hash,
        size,
        mode,
    })
}

/// Regular files and symlinks
fn entry_count(index: &[IndexEntry]) -> u64 {
    index.iter().filter(|e| e.kind != EntryKind::Dir).count() as u64
}

fn total_size(index: &[IndexEntry]) -> u64 {
    index.iter().map(|e| e.size).sum()
}

fn index_marker(index: &[IndexEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in index {
        hasher.update(&entry.path);
        hasher.update([0, entry.kind.tag(), 0]);
        hasher.update(entry.hash.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:o}", entry.mode).as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

fn link_target(path: &Path) -> Result<Vec<u8>> {
    let target = fs::read_link(path)?;
    Ok(utils::os_bytes(target.as_os_str())?.to_vec())
}

#[cfg(unix)]
fn create_symlink(target: &[u8], link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(utils::os_from_bytes(target), link)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(_target: &[u8], link: &Path) -> Result<()> {
    Err(ChainError::codec(link, "symlinks are not supported on this platform"))
}

/// Join an archive key onto `root`, refusing anything that escapes it
fn safe_join(root: &Path, key: &[u8]) -> Result<PathBuf> {
    let relative = utils::path_from_bytes(key);
    let escapes = key
        .split(|b| *b == b'/')
        .any(|part| part.is_empty() || part == b"." || part == b"..")
        || relative.components().any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(ChainError::codec(
            root,
            format!("archive entry {:?} escapes the target", String::from_utf8_lossy(key)),
        ));
    }
    Ok(root.join(relative))
}

/// Remove whatever sits at `path`; returns false if nothing was there
fn remove_path(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    Ok(true)
}

/// Copy `reader` into `writer` chunk by chunk
///
/// Returns the number of bytes copied and their SHA-256.
fn copy_hashed(reader: &mut impl Read, writer: &mut impl Write) -> Result<(u64, String)> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut hasher = Sha256::new();
    let mut total = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
        writer.write_all(&buffer[..bytes_read])?;
        total += bytes_read as u64;
    }

    Ok((total, hex::encode(hasher.finalize())))
}

/// Stream a blob to `out`, reading the content of `packed` from `source`
///
/// The blob is written to a temporary file next to `out` and renamed into
/// place once complete.
fn write_blob(out: &Path, header: &Header, source: &Path, packed: &[&IndexEntry]) -> Result<u64> {
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT_VERSION])?;

        let mut encoder = FrameEncoder::new(writer);
        bincode::serde::encode_into_std_write(header, &mut encoder, bincode::config::standard())?;
        for entry in packed {
            pack_entry(&mut encoder, source, entry)?;
        }
        let mut writer = encoder
            .finish()
            .map_err(|e| ChainError::codec(out, format!("compression failed: {e}")))?;
        writer.flush()?;
    }

    tmp.as_file().sync_all()?;
    let size = tmp.as_file().metadata()?.len();
    tmp.persist(out).map_err(|e| e.error)?;
    Ok(size)
}

fn pack_entry<W: Write>(encoder: &mut W, source: &Path, entry: &IndexEntry) -> Result<()> {
    let path = source.join(utils::path_from_bytes(&entry.path));
    let changed = || ChainError::codec(&path, "changed while the snapshot was taken");
    let record = |len| Record {
        path: entry.path.clone(),
        kind: entry.kind,
        len,
    };

    match entry.kind {
        EntryKind::Dir => {
            bincode::serde::encode_into_std_write(record(0), encoder, bincode::config::standard())?;
        }
        EntryKind::File => {
            bincode::serde::encode_into_std_write(record(entry.size), &mut *encoder, bincode::config::standard())?;
            let mut content = File::open(&path)?.take(entry.size);
            let (copied, hash) = copy_hashed(&mut content, encoder)?;
            if copied != entry.size || hash != entry.hash {
                return Err(changed());
            }
        }
        EntryKind::Symlink => {
            let target = link_target(&path)?;
            if utils::hash_data(&target) != entry.hash {
                return Err(changed());
            }
            bincode::serde::encode_into_std_write(
                record(target.len() as u64),
                &mut *encoder,
                bincode::config::standard(),
            )?;
            encoder.write_all(&target)?;
        }
    }
    Ok(())
}

/// Open a blob and decode its header, leaving the stream at the first record
fn open_blob(blob: &Path) -> Result<(Header, FrameDecoder<BufReader<File>>)> {
    let mut reader = BufReader::new(File::open(blob)?);
    let mut prefix = [0u8; 5];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ChainError::codec(blob, "not a directory snapshot"));
        }
        Err(e) => return Err(e.into()),
    }
    if &prefix[..MAGIC.len()] != MAGIC {
        return Err(ChainError::codec(blob, "not a directory snapshot"));
    }
    if prefix[MAGIC.len()] != FORMAT_VERSION {
        return Err(ChainError::codec(
            blob,
            format!("unsupported snapshot format version {}", prefix[MAGIC.len()]),
        ));
    }

    let mut decoder = FrameDecoder::new(reader);
    let header = bincode::serde::decode_from_std_read(&mut decoder, bincode::config::standard())?;
    Ok((header, decoder))
}

fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl SnapshotCodec for DirectoryCodec {
    fn target_kind(&self) -> TargetKind {
        TargetKind::Directory
    }

    fn extension(&self) -> &'static str {
        "snap"
    }

    fn probe(&self, source: &Path) -> Result<SourceProbe> {
        let index = self.scan(source, Some(&self.excludes))?;
        Ok(SourceProbe {
            marker: index_marker(&index),
            size_bytes: total_size(&index),
        })
    }

    fn create(&self, source: &Path, mode: SnapshotMode<'_>, out: &Path) -> Result<SnapshotInfo> {
        self.snapshot(source, mode, out, Some(&self.excludes))
    }

    fn create_replayed(&self, tree: &Path, out: &Path) -> Result<SnapshotInfo> {
        self.snapshot(tree, SnapshotMode::Full, out, None)
    }

    fn apply(&self, blob: &Path, target: &Path) -> Result<()> {
        let (header, mut decoder) = open_blob(blob)?;
        if header.base.is_none() && !utils::is_missing_or_empty(target)? {
            return Err(ChainError::codec(target, "full snapshot must be applied to an empty directory"));
        }
        fs::create_dir_all(target)?;

        // Children sort after their parents
        for key in header.deleted.iter().rev() {
            let path = safe_join(target, key)?;
            if !remove_path(&path)? {
                warn!(
                    "Deleted path {} already absent in {:?}",
                    String::from_utf8_lossy(key),
                    target
                );
            }
        }

        let entries: HashMap<&[u8], &IndexEntry> =
            header.index.iter().map(|e| (e.path.as_slice(), e)).collect();
        let mut bytes_written = 0u64;
        for _ in 0..header.packed {
            let record: Record = bincode::serde::decode_from_std_read(&mut decoder, bincode::config::standard())?;
            let entry = entries
                .get(record.path.as_slice())
                .copied()
                .filter(|e| e.kind == record.kind)
                .ok_or_else(|| {
                    ChainError::codec(
                        blob,
                        format!("packed entry {} is not in the index", String::from_utf8_lossy(&record.path)),
                    )
                })?;
            let path = safe_join(target, &record.path)?;
            let mismatch = || ChainError::codec(&path, "content does not match the snapshot index");

            match record.kind {
                EntryKind::Dir => {
                    let occupied = fs::symlink_metadata(&path).is_ok_and(|m| !m.is_dir());
                    if occupied {
                        remove_path(&path)?;
                    }
                    fs::create_dir_all(&path)?;
                }
                EntryKind::File => {
                    prepare_parent(&path)?;
                    remove_path(&path)?;
                    let mut file = File::create(&path)?;
                    let mut content = decoder.by_ref().take(record.len);
                    let (copied, hash) = copy_hashed(&mut content, &mut file)?;
                    if copied != record.len || hash != entry.hash {
                        return Err(mismatch());
                    }
                    utils::set_permissions(&path, entry.mode)?;
                    bytes_written += copied;
                }
                EntryKind::Symlink => {
                    let mut link = Vec::new();
                    decoder.by_ref().take(record.len).read_to_end(&mut link)?;
                    if utils::hash_data(&link) != entry.hash {
                        return Err(mismatch());
                    }
                    prepare_parent(&path)?;
                    remove_path(&path)?;
                    create_symlink(&link, &path)?;
                }
            }
        }

        trace!(
            "Applied {:?} to {:?}: {} entries written ({}), {} removed",
            blob,
            target,
            header.packed,
            utils::format_bytes(bytes_written),
            header.deleted.len()
        );
        Ok(())
    }

    fn inspect(&self, target: &Path, expected: &Artifact) -> Result<Inspection> {
        let index = self.scan(target, None)?;
        let stats = &expected.stats;
        let mut inspection = Inspection::default();

        let count = entry_count(&index);
        inspection.check(count == stats.file_count, || {
            format!("file count {} does not match recorded {}", count, stats.file_count)
        });
        let total = total_size(&index);
        inspection.check(total == stats.total_bytes, || {
            format!("total size {} does not match recorded {}", total, stats.total_bytes)
        });

        let hashes: HashMap<&[u8], &str> = index
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| (e.path.as_slice(), e.hash.as_str()))
            .collect();
        for spot in &stats.spot_checks {
            inspection.check(hashes.get(spot.path.as_bytes()) == Some(&spot.checksum.as_str()), || {
                format!("spot check failed for {}", spot.path)
            });
        }

        let marker = index_marker(&index);
        inspection.check(marker == expected.range_end, || {
            format!("tree digest {} does not match range end {}", marker, expected.range_end)
        });
        Ok(inspection)
    }
}
