//! On-disk content-addressed blob store.
//!
//! Layout: `<blob_dir>/<cid>.blob`
//!
//! Files are write-once and content-addressed, so there are no race
//! conditions to worry about — if two writers produce the same CID they
//! write identical bytes.
//!
//! Handles are CIDv1 strings:
//! - Hash function: BLAKE3 (multicodec 0x1e)
//! - Codec:         raw    (multicodec 0x55)
//! - Encoding:      base32lower (multibase prefix 'b')

use std::fs;
use std::path::{Path, PathBuf};

use cid::Cid;
use multihash::Multihash;

use crate::error::{Result, StateError};

/// BLAKE3 multicodec identifier.
const BLAKE3_CODE: u64 = 0x1e;

/// "raw" codec — the data is unstructured bytes.
const RAW_CODEC: u64 = 0x55;

/// Hash `data` with BLAKE3 and return its CIDv1 string.
pub fn cid_from_data(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    let mh = Multihash::<64>::wrap(BLAKE3_CODE, hash.as_bytes())
        .expect("blake3 32-byte digest always fits in 64-byte multihash");
    Cid::new_v1(RAW_CODEC, mh).to_string()
}

/// Filesystem-backed blob store keyed by CID.
pub struct BlobStore {
    blob_dir: PathBuf,
}

impl BlobStore {
    /// Open (or create) a blob store rooted at `blob_dir`.
    pub fn new(blob_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&blob_dir)?;
        Ok(Self { blob_dir })
    }

    /// Path on disk for a given handle.
    pub fn blob_path(&self, handle: &str) -> PathBuf {
        self.blob_dir.join(format!("{handle}.blob"))
    }

    /// Check whether a blob exists locally.
    pub fn has(&self, handle: &str) -> bool {
        self.blob_path(handle).exists()
    }

    /// Store `data` and return its content handle.
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let handle = cid_from_data(data);
        let path = self.blob_path(&handle);
        if !path.exists() {
            fs::write(&path, data)?;
        }
        Ok(handle)
    }

    /// Read an entire blob into memory.
    pub fn get(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(handle);
        if !path.exists() {
            return Err(StateError::NotFound(handle.to_string()));
        }
        Ok(fs::read(&path)?)
    }

    /// Size in bytes of a stored blob.
    pub fn size(&self, handle: &str) -> Result<u64> {
        let path = self.blob_path(handle);
        if !path.exists() {
            return Err(StateError::NotFound(handle.to_string()));
        }
        Ok(fs::metadata(&path)?.len())
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.blob_dir
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
