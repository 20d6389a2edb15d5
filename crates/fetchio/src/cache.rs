//! Content-addressed stream-deduplication cache.
//!
//! Objects live under `objects/ab/cdef…` keyed by their SHA-256, with a
//! JSON index mapping repository paths to hashes. Materialization prefers
//! hard links (reflink-cheap on CoW filesystems) and falls back to a plain
//! copy across filesystems, so a model shared between two destination
//! directories costs its bytes once.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{FetchError, Result};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    hash: String,
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, CacheRecord>,
}

/// Directory of hash-named objects plus a JSON index.
pub struct StreamCache {
    root: PathBuf,
    index: Mutex<CacheIndex>,
}

impl StreamCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;

        let index_path = root.join(INDEX_FILE);
        let index = match fs::read_to_string(&index_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %index_path.display(), error = %e, "cache index unreadable, starting fresh");
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join("objects").join(&hash[..2]).join(&hash[2..])
    }

    pub fn contains(&self, hash: &str) -> bool {
        hash.len() == 64 && self.object_path(hash).is_file()
    }

    /// Stream-hash a file the same way the downloader does.
    pub fn compute_hash(path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Adopt `source` into the cache under `name`, returning its hash.
    ///
    /// When the caller already verified the content (a checksummed
    /// download), pass the hash to skip re-reading the file.
    pub fn insert(&self, name: &str, source: &Path, known_hash: Option<&str>) -> Result<String> {
        let hash = match known_hash {
            Some(h) if h.len() == 64 => h.to_owned(),
            _ => Self::compute_hash(source)?,
        };

        let object = self.object_path(&hash);
        if !object.exists() {
            if let Some(parent) = object.parent() {
                fs::create_dir_all(parent)?;
            }
            // Same-filesystem link shares the blocks; cross-filesystem falls
            // back to a copy.
            if fs::hard_link(source, &object).is_err() {
                fs::copy(source, &object)?;
            }
            debug!(hash = %hash, "cached object");
        }

        let size = fs::metadata(source)?.len();
        {
            let mut index = self.index.lock();
            index.entries.insert(
                name.to_owned(),
                CacheRecord {
                    hash: hash.clone(),
                    size,
                },
            );
            self.save_index(&index)?;
        }
        Ok(hash)
    }

    /// Materialize the object for `hash` at `destination`. Returns false
    /// when the object is not cached.
    pub fn materialize(&self, hash: &str, destination: &Path) -> Result<bool> {
        if !self.contains(hash) {
            return Ok(false);
        }
        let object = self.object_path(hash);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if destination.exists() {
            fs::remove_file(destination)?;
        }
        if fs::hard_link(&object, destination).is_err() {
            fs::copy(&object, destination)?;
        }
        debug!(hash = %hash, dest = %destination.display(), "materialized cached object");
        Ok(true)
    }

    pub fn lookup(&self, name: &str) -> Option<(String, u64)> {
        let index = self.index.lock();
        index
            .entries
            .get(name)
            .map(|record| (record.hash.clone(), record.size))
    }

    fn save_index(&self, index: &CacheIndex) -> Result<()> {
        let raw = serde_json::to_string_pretty(index)
            .map_err(|e| FetchError::parse(format!("cache index serialize: {e}")))?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, self.root.join(INDEX_FILE))?;
        Ok(())
    }
}
