//! Cache size ledger
//!
//! The ledger is a sibling file `<prefix>.cache_info` holding the running
//! total of bytes stored in the cache directory. Its lock is also the
//! directory-level coordination lock: held exclusively to create entries,
//! update the total, purge and remove; held shared to open entries for
//! reading.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CacheError, CacheResult};
use crate::lock::{self, LockMode, LockResult};

/// Persisted ledger contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub total_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// Handle on the ledger file of one cache directory.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Ledger file name suffix, appended to the cache prefix.
    pub const FILE_SUFFIX: &'static str = ".cache_info";

    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            path: dir.join(format!("{}{}", prefix, Self::FILE_SUFFIX)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Take the coordination lock shared. Blocks.
    pub fn lock_shared(&self) -> LockResult<LedgerGuard> {
        self.lock(LockMode::Shared)
    }

    /// Take the coordination lock exclusively. Blocks.
    pub fn lock_exclusive(&self) -> LockResult<LedgerGuard> {
        self.lock(LockMode::Exclusive)
    }

    fn lock(&self, mode: LockMode) -> LockResult<LedgerGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        lock::lock_file(&file, mode)?;
        Ok(LedgerGuard {
            path: self.path.clone(),
            file,
            mode,
        })
    }
}

/// The held coordination lock, with access to the ledger record.
///
/// Released when dropped.
#[derive(Debug)]
pub struct LedgerGuard {
    path: PathBuf,
    file: File,
    mode: LockMode,
}

impl LedgerGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Current total, or `None` when the ledger is empty or unreadable and
    /// has to be recomputed from the directory.
    pub fn read_total(&mut self) -> CacheResult<Option<u64>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        self.file.read_to_end(&mut contents)?;

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        match serde_json::from_slice::<LedgerRecord>(&contents) {
            Ok(record) => Ok(Some(record.total_bytes)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable cache ledger, recomputing");
                Ok(None)
            }
        }
    }

    /// Replace the recorded total. Requires the exclusive lock.
    pub fn write_total(&mut self, total_bytes: u64) -> CacheResult<()> {
        if self.mode != LockMode::Exclusive {
            return Err(CacheError::Ledger(format!(
                "ledger {} written without the exclusive lock",
                self.path.display()
            )));
        }

        let record = LedgerRecord {
            total_bytes,
            updated_at: Utc::now(),
        };
        let mut contents = serde_json::to_vec(&record)
            .map_err(|e| CacheError::Ledger(format!("failed to serialize ledger: {}", e)))?;
        contents.push(b'\n');

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&contents)?;
        Ok(())
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        if let Err(e) = lock::unlock_file(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release coordination lock");
        }
    }
}
