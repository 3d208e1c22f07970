//! Content-addressed object store.
//!
//! Objects are stored by the SHA-256 of their bytes, under nested shard
//! directories cut from the front of the hex digest:
//!
//!   {root}/{hex[0..3]}/{hex[3..6]}/{hex[6..9]}/{hex}
//!
//! Identical content always lands on the same path, so writing it again
//! replaces the file in place instead of creating a second copy. The shard
//! directories are one [`PathTransform`]; a store can be opened with any
//! other.
//!
//! Writes are single-pass: the source is hashed while it is copied into a
//! temporary file under `{root}/.tmp`, and only then renamed onto its final
//! path. Non-seekable sources are read exactly once, and a failed copy never
//! leaves a partial object behind.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use dfs_core::config::StorageConfig;

use crate::error::{StoreError, StoreResult};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

const TMP_DIR: &str = ".tmp";
const COPY_BUF_LEN: usize = 64 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Layout ────────────────────────────────────────────────────────────────────

/// Maps a content digest to the directory its object is stored in.
///
/// The directory is relative to the store root and may be empty. It must
/// not climb out of the root or land in the store's scratch directory; the
/// store refuses such paths with [`StoreError::InvalidPath`].
pub trait PathTransform: fmt::Debug + Send + Sync {
    fn dir_for(&self, hash: &str) -> PathBuf;
}

/// How a digest is cut into nested directory names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    depth: usize,
    width: usize,
}

impl ShardLayout {
    /// Three levels of three hex characters.
    pub const DEFAULT: ShardLayout = ShardLayout { depth: 3, width: 3 };

    pub fn new(depth: usize, width: usize) -> StoreResult<Self> {
        if depth == 0 || width == 0 || depth * width > HASH_HEX_LEN {
            return Err(StoreError::InvalidLayout {
                depth,
                width,
                max: HASH_HEX_LEN,
            });
        }
        Ok(Self { depth, width })
    }

    /// Consume `reader` to its end and derive where its content belongs.
    pub fn transform<R: Read>(&self, reader: R) -> StoreResult<ContentPath> {
        let hash = digest(reader)?;
        Ok(ContentPath {
            dir: self.dir_for(&hash),
            hash,
        })
    }
}

impl PathTransform for ShardLayout {
    fn dir_for(&self, hash: &str) -> PathBuf {
        (0..self.depth)
            .map(|level| &hash[level * self.width..(level + 1) * self.width])
            .collect()
    }
}

impl Default for ShardLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Location of one object, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPath {
    /// Shard directories, e.g. `2cf/24d/ba5`.
    pub dir: PathBuf,
    /// Full lowercase hex digest; also the file name.
    pub hash: String,
}

impl ContentPath {
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.hash)
    }
}

/// Hash `reader` and derive its path with the default 3×3 layout.
pub fn cas_path_transform<R: Read>(reader: R) -> StoreResult<ContentPath> {
    ShardLayout::DEFAULT.transform(reader)
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Content-addressed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
    transform: Arc<dyn PathTransform>,
}

impl CasStore {
    /// Open (creating if needed) a store at `root`.
    pub fn new(root: impl Into<PathBuf>, layout: ShardLayout) -> StoreResult<Self> {
        Self::with_path_transform(root, layout)
    }

    /// Open a store whose objects are placed by `transform`.
    pub fn with_path_transform(
        root: impl Into<PathBuf>,
        transform: impl PathTransform + 'static,
    ) -> StoreResult<Self> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|source| StoreError::CreateDir { path: tmp, source })?;
        Ok(Self {
            root,
            transform: Arc::new(transform),
        })
    }

    pub fn from_config(config: &StorageConfig) -> StoreResult<Self> {
        let layout = ShardLayout::new(config.shard_depth, config.shard_width)?;
        Self::new(config.root.clone(), layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Consume `reader` and derive its relative directory and hash.
    /// Nothing is written.
    pub fn path_transform<R: Read>(&self, reader: R) -> StoreResult<ContentPath> {
        self.content_path(digest(reader)?)
    }

    fn content_path(&self, hash: String) -> StoreResult<ContentPath> {
        let dir = self.transform.dir_for(&hash);
        let mut components = dir.components();
        let escapes = components
            .clone()
            .any(|c| !matches!(c, Component::Normal(_)));
        let scratch = components.next() == Some(Component::Normal(TMP_DIR.as_ref()));
        if escapes || scratch {
            return Err(StoreError::InvalidPath(dir));
        }
        Ok(ContentPath { dir, hash })
    }

    /// Persist everything `reader` yields under its content address.
    ///
    /// The source is read once. Writing content that is already stored
    /// replaces the existing file with the new bytes.
    pub fn write_stream<R: Read>(&self, mut reader: R) -> StoreResult<ContentPath> {
        let mut tmp = TempObject::create(&self.root.join(TMP_DIR))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut written: u64 = 0;
        loop {
            let n = read_some(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            written += n as u64;
        }
        tmp.sync()?;

        let content = self.content_path(hex::encode(hasher.finalize()))?;
        let dir = self.root.join(&content.dir);
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        tmp.persist(&dir.join(&content.hash))?;

        tracing::info!(hash = %content.hash, bytes = written, "object stored");
        Ok(content)
    }

    /// Persist an in-memory buffer.
    pub fn write_bytes(&self, data: &[u8]) -> StoreResult<ContentPath> {
        self.write_stream(data)
    }

    /// Absolute path an object with `hash` is (or would be) stored at.
    pub fn path_of(&self, hash: &str) -> StoreResult<PathBuf> {
        let hash = normalize_hash(hash)?;
        Ok(self.root.join(self.content_path(hash)?.file_path()))
    }

    /// Check if an object is stored.
    pub fn has(&self, hash: &str) -> bool {
        self.path_of(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Open a stored object for reading.
    pub fn open(&self, hash: &str) -> StoreResult<File> {
        let path = self.path_of(hash)?;
        match File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_ascii_lowercase()))
            }
            Err(source) => Err(StoreError::Open { path, source }),
        }
    }

    /// Read a stored object fully into memory.
    pub fn read(&self, hash: &str) -> StoreResult<Vec<u8>> {
        let mut file = self.open(hash)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(StoreError::Read)?;
        Ok(data)
    }

    /// Count stored objects (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        walk_objects(&self.root, true, &mut |_: &fs::Metadata| total += 1);
        total
    }

    /// Total stored bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        walk_objects(&self.root, true, &mut |meta: &fs::Metadata| {
            total += meta.len()
        });
        total
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Hex SHA-256 of everything `reader` yields.
fn digest<R: Read>(mut reader: R) -> StoreResult<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = read_some(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Visit every stored object under `dir`, at any depth. The scratch
/// directory at the root is skipped.
fn walk_objects(dir: &Path, is_root: bool, f: &mut dyn FnMut(&fs::Metadata)) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if is_root && entry.file_name() == TMP_DIR {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            walk_objects(&entry.path(), false, f);
        } else if meta.is_file() {
            f(&meta);
        }
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> StoreResult<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::Read(e)),
        }
    }
}

fn normalize_hash(hash: &str) -> StoreResult<String> {
    if hash.len() != HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidHash(hash.to_string()));
    }
    Ok(hash.to_ascii_lowercase())
}

/// A temporary file that is removed unless it is persisted.
struct TempObject {
    path: PathBuf,
    file: Option<File>,
}

impl TempObject {
    fn create(tmp_dir: &Path) -> StoreResult<Self> {
        let name = format!(
            "{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = tmp_dir.join(name);
        let file = File::create(&path).map_err(|source| StoreError::CreateFile {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_all().map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn persist(mut self, to: &Path) -> StoreResult<()> {
        // Close before rename
        self.file.take();
        fs::rename(&self.path, to).map_err(|source| StoreError::Persist {
            from: self.path.clone(),
            to: to.to_path_buf(),
            source,
        })?;
        self.path = PathBuf::new();
        Ok(())
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        self.file.take();
        if !self.path.as_os_str().is_empty() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temp object");
            }
        }
    }
}
