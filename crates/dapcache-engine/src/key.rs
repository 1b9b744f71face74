//! Resource id to cache file name mapping
//!
//! A resource id hashes to a bucket name. Ids that collide on a bucket are
//! told apart by a numeric suffix, so one entry lives at
//! `<cache_dir>/<prefix><bucket>_<suffix>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Number of hex characters of the digest used as the bucket name.
const BUCKET_HEX_LEN: usize = 16;

/// Maps a resource id to a bucket name.
///
/// Implementations must be deterministic across processes and runs: every
/// process sharing a cache directory has to agree on the bucket for an id.
pub trait BucketHasher: Send + Sync {
    fn bucket_name(&self, resource_id: &str) -> String;

    /// Whether `name` has the shape of a bucket name this hasher produces.
    /// Files in the cache directory with other names are left alone.
    fn is_bucket_name(&self, name: &str) -> bool {
        !name.is_empty()
    }
}

/// Default hasher: the first 64 bits of SHA-256, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl BucketHasher for Sha256Hasher {
    fn bucket_name(&self, resource_id: &str) -> String {
        let digest = Sha256::digest(resource_id.as_bytes());
        let mut name = hex::encode(digest);
        name.truncate(BUCKET_HEX_LEN);
        name
    }

    fn is_bucket_name(&self, name: &str) -> bool {
        name.len() == BUCKET_HEX_LEN && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

/// Where one cache entry lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryLocation {
    pub bucket: String,
    pub suffix: u32,
    pub path: PathBuf,
}

impl EntryLocation {
    /// The entry's file name, e.g. `rc1f0e3dad99908345_0`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for EntryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Derives bucket names and candidate paths for one cache directory.
#[derive(Clone)]
pub struct KeyDeriver {
    dir: PathBuf,
    prefix: String,
    hasher: Arc<dyn BucketHasher>,
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl KeyDeriver {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, hasher: Arc<dyn BucketHasher>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            hasher,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Bucket name for a resource id.
    pub fn derive(&self, resource_id: &str) -> String {
        self.hasher.bucket_name(resource_id)
    }

    /// Path of the entry for `bucket` with the given collision suffix.
    pub fn candidate_path(&self, bucket: &str, suffix: u32) -> PathBuf {
        self.dir.join(format!("{}{}_{}", self.prefix, bucket, suffix))
    }

    pub fn location(&self, bucket: &str, suffix: u32) -> EntryLocation {
        EntryLocation {
            bucket: bucket.to_string(),
            suffix,
            path: self.candidate_path(bucket, suffix),
        }
    }

    /// Split an entry file name into bucket and suffix.
    ///
    /// Returns `None` for anything that is not an entry of this cache: the
    /// ledger, files of other prefixes, stray files.
    pub fn parse_file_name(&self, name: &str) -> Option<(String, u32)> {
        if name.contains('/') || name.contains('\\') {
            return None;
        }
        let rest = name.strip_prefix(&self.prefix)?;
        let (bucket, suffix) = rest.rsplit_once('_')?;
        if !self.hasher.is_bucket_name(bucket) || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let suffix = suffix.parse().ok()?;
        Some((bucket.to_string(), suffix))
    }

    pub fn is_entry_file(&self, name: &str) -> bool {
        self.parse_file_name(name).is_some()
    }

    /// Location for an entry file name, if it names an entry of this cache.
    pub fn location_for_file_name(&self, name: &str) -> Option<EntryLocation> {
        let (bucket, suffix) = self.parse_file_name(name)?;
        Some(EntryLocation {
            path: self.dir.join(name),
            bucket,
            suffix,
        })
    }
}
