//! Size-bounded purge
//!
//! When the ledger total goes over the size limit, entries are deleted
//! oldest modification time first until the cache is down to the purge
//! target. Entries somebody holds a lock on are skipped, never waited for.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::engine::CacheEngine;
use crate::error::CacheResult;
use crate::lock::EntryLock;

/// Result of a purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Number of entries scanned
    pub scanned: usize,
    /// Number of entries deleted
    pub deleted: usize,
    /// Entries skipped (locked or excluded)
    pub skipped: usize,
    pub bytes_reclaimed: u64,
    /// Size of the cache after the purge
    pub bytes_remaining: u64,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
}

impl PurgeReport {
    /// True if the purge got the cache down to `target` bytes.
    pub fn reached(&self, target: u64) -> bool {
        self.bytes_remaining <= target
    }
}

impl CacheEngine {
    /// Shrink the cache to its purge target.
    pub fn purge(&self) -> CacheResult<PurgeReport> {
        self.run_purge(None, false)
    }

    /// Report what [`purge`](Self::purge) would delete without deleting.
    pub fn purge_dry_run(&self) -> CacheResult<PurgeReport> {
        self.run_purge(None, true)
    }

    /// Purge, never touching `exclude` (the entry the caller just wrote).
    pub(crate) fn run_purge_excluding(&self, exclude: &Path) -> CacheResult<PurgeReport> {
        self.run_purge(Some(exclude), false)
    }

    fn run_purge(&self, exclude: Option<&Path>, dry_run: bool) -> CacheResult<PurgeReport> {
        let mut coordination = self.ledger().lock_exclusive()?;

        let mut entries = self.entries()?;
        entries.sort_by_key(|e| e.modified);

        let mut report = PurgeReport {
            scanned: entries.len(),
            ..Default::default()
        };
        let target = self.config().purge_target_bytes();
        let mut current_size: u64 = entries.iter().map(|e| e.size_bytes).sum();

        for entry in &entries {
            if current_size <= target {
                break;
            }

            let path = &entry.location.path;
            if exclude == Some(path.as_path()) {
                report.skipped += 1;
                continue;
            }

            let lock = match EntryLock::try_exclusive(path) {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    debug!(path = %path.display(), "entry in use, not purging");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.errors.push(format!("failed to lock {}: {}", path.display(), e));
                    continue;
                }
            };

            if dry_run {
                info!(path = %path.display(), bytes = entry.size_bytes, "purge dry run: would delete");
            } else if let Err(e) = fs::remove_file(path) {
                report.errors.push(format!("failed to delete {}: {}", path.display(), e));
                continue;
            } else {
                debug!(path = %path.display(), bytes = entry.size_bytes, "purged cache entry");
            }
            drop(lock);

            report.deleted += 1;
            report.bytes_reclaimed += entry.size_bytes;
            current_size = current_size.saturating_sub(entry.size_bytes);
        }

        report.bytes_remaining = current_size;

        if !dry_run {
            coordination.write_total(current_size)?;
        }

        for error in &report.errors {
            warn!(error = %error, "purge error");
        }
        info!(
            deleted = report.deleted,
            skipped = report.skipped,
            bytes_reclaimed = report.bytes_reclaimed,
            bytes_remaining = report.bytes_remaining,
            target,
            dry_run,
            "cache purge finished"
        );

        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Outcome;
    use std::io::{BufRead, Write};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn open_engine(temp_dir: &TempDir, limit: u64) -> CacheEngine {
        CacheEngine::open(EngineConfig::new(temp_dir.path(), "rc", limit))
            .unwrap()
            .unwrap()
    }

    /// Cache `id` with a payload making the entry exactly `size` bytes.
    fn put(engine: &CacheEngine, id: &str, size: usize) -> std::path::PathBuf {
        let body = vec![b'x'; size - id.len() - 1];
        let cached = engine
            .lookup_or_create(
                id,
                |w: &mut dyn Write| {
                    w.write_all(&body)?;
                    Ok(())
                },
                |r: &mut dyn BufRead| {
                    let mut buf = Vec::new();
                    r.read_to_end(&mut buf)?;
                    Ok(buf.len())
                },
            )
            .unwrap();
        assert_eq!(cached.outcome, Outcome::Created);
        cached.entry.path
    }

    fn age(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        fs::File::options().write(true).open(path).unwrap().set_modified(when).unwrap();
    }

    #[test]
    fn test_purge_under_target_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 10_000);
        put(&engine, "a", 100);

        let report = engine.purge().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.bytes_remaining, 100);
    }

    #[test]
    fn test_purge_leaves_stray_files() {
        let temp_dir = TempDir::new().unwrap();
        let stray = temp_dir.path().join("rcache_backup_1");
        fs::write(&stray, vec![b'x'; 5000]).unwrap();
        age(&stray, 1000);

        let engine = open_engine(&temp_dir, 1000);
        put(&engine, "a", 900);
        let report = engine.purge().unwrap();

        assert!(stray.exists());
        assert_eq!(report.scanned, 1);
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn test_purge_removes_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 10_000);
        let oldest = put(&engine, "oldest", 400);
        let middle = put(&engine, "middle", 400);
        let newest = put(&engine, "newest", 400);
        age(&oldest, 300);
        age(&middle, 200);
        age(&newest, 100);

        let engine = CacheEngine::open(EngineConfig::new(temp_dir.path(), "rc", 1000).with_purge_target_ratio(0.8))
            .unwrap()
            .unwrap();
        let report = engine.purge().unwrap();

        // 1200 bytes, target 800: one deletion is enough
        assert_eq!(report.deleted, 1);
        assert_eq!(report.bytes_reclaimed, 400);
        assert!(report.reached(800));
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert_eq!(engine.ledger_total().unwrap(), Some(800));
    }

    #[test]
    fn test_purge_skips_locked_entries() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 10_000);
        let held = put(&engine, "held", 500);
        let free = put(&engine, "free", 500);
        age(&held, 200);
        age(&free, 100);

        let engine = open_engine(&temp_dir, 600);
        let _reader = EntryLock::block_until_shared(&held).unwrap().unwrap();
        let report = engine.purge().unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 1);
        assert!(held.exists());
        assert!(!free.exists());
        assert_eq!(report.bytes_remaining, 500);
    }

    #[test]
    fn test_purge_dry_run_deletes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 10_000);
        let a = put(&engine, "a", 600);
        let b = put(&engine, "b", 600);

        let engine = open_engine(&temp_dir, 1000);
        let report = engine.purge_dry_run().unwrap();

        assert_eq!(report.deleted, 1);
        assert!(a.exists());
        assert!(b.exists());
        assert_eq!(engine.ledger_total().unwrap(), Some(1200));
    }

    #[test]
    fn test_write_over_limit_triggers_purge() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 1000);
        let first = put(&engine, "first", 600);
        age(&first, 100);

        let second = put(&engine, "second", 600);

        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(engine.ledger_total().unwrap(), Some(600));
    }

    #[test]
    fn test_purge_never_removes_excluded_entry() {
        let temp_dir = TempDir::new().unwrap();
        let engine = open_engine(&temp_dir, 10_000);
        let only = put(&engine, "only", 2000);

        let engine = open_engine(&temp_dir, 1000);
        let report = engine.run_purge_excluding(&only).unwrap();

        assert!(only.exists());
        assert_eq!(report.skipped, 1);
        assert!(!report.reached(800));
    }
}
