//! The locking content-addressed cache engine
//!
//! Protocol for one lookup, per collision suffix of the resource's bucket:
//! 1. Wait for a shared lock on the candidate entry. If it exists and its
//!    first line is the resource id, it is a hit.
//! 2. If the entry is absent, try to create it under an exclusive lock,
//!    write the id line and the payload, account for it in the ledger, purge
//!    if the cache is too big, then downgrade to shared and read it back.
//! 3. If another writer won the race, wait for its entry and check again.
//!
//! Another resource id in the entry means a bucket collision: move on to the
//! next suffix. Running out of suffixes is fatal.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{CollisionStrategy, EngineConfig};
use crate::error::{CacheError, CacheResult};
use crate::key::{BucketHasher, EntryLocation, KeyDeriver, Sha256Hasher};
use crate::ledger::{Ledger, LedgerGuard};
use crate::lock::{EntryLock, OpenedEntry};

/// Longest resource id the engine accepts.
pub const MAX_RESOURCE_ID_LEN: usize = 16 * 1024;

/// Attempts at reclaiming one orphan before treating its slot as taken.
const ORPHAN_RECLAIM_ATTEMPTS: u32 = 10;
const ORPHAN_RECLAIM_BACKOFF: Duration = Duration::from_millis(20);

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Read from an entry that was already published.
    Hit,
    /// Produced by this call and published.
    Created,
}

/// Value returned by a lookup, with where it came from.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: T,
    pub entry: EntryLocation,
    pub outcome: Outcome,
}

impl<T> Cached<T> {
    pub fn was_hit(&self) -> bool {
        self.outcome == Outcome::Hit
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// What to do with an entry older than its upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Serve it and log a warning.
    Serve,
    /// Remove it and produce a new one; serve it anyway if it is in use.
    Regenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The entry has no content.
    Empty,
    /// The upstream source was modified after the entry was written.
    SourceNewer,
    /// There is no entry at all.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Result of removing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed { bytes: u64 },
    NotFound,
    /// Another holder has the entry locked; nothing was deleted.
    InUse,
}

/// One entry file as observed on disk.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub location: EntryLocation,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entry files
    pub entries: usize,
    /// Bytes used by entry files, from a directory scan
    pub disk_bytes: u64,
    /// Bytes recorded in the ledger
    pub ledger_bytes: Option<u64>,
    pub size_limit_bytes: u64,
}

enum Header {
    Complete { id: Vec<u8>, len: u64 },
    Incomplete,
}

enum Probe {
    Match { lock: EntryLock, header_len: u64 },
    Collision,
    Orphan,
    Absent,
}

enum Slot {
    Hit { lock: EntryLock, header_len: u64 },
    Vacant(EntryLock),
    Occupied,
}

/// Disk cache shared by every process that opens the same directory.
///
/// Construct one per configuration and share it (it is `Send + Sync`); all
/// cross-process safety comes from file locks, not from this value.
#[derive(Debug)]
pub struct CacheEngine {
    config: EngineConfig,
    keys: KeyDeriver,
    ledger: Ledger,
}

impl CacheEngine {
    /// Open the cache described by `config`.
    ///
    /// `Ok(None)` means the cache is unavailable (no directory, size limit of
    /// zero, directory not writable). Callers are expected to carry on
    /// without caching.
    pub fn open(config: EngineConfig) -> CacheResult<Option<Self>> {
        Self::open_with_hasher(config, Arc::new(Sha256Hasher))
    }

    pub fn open_with_hasher(
        config: EngineConfig,
        hasher: Arc<dyn BucketHasher>,
    ) -> CacheResult<Option<Self>> {
        if let Some(reason) = config.unavailable_reason() {
            warn!(dir = %config.cache_dir.display(), prefix = %config.prefix, %reason, "cache unavailable");
            return Ok(None);
        }

        let engine = Self {
            keys: KeyDeriver::new(&config.cache_dir, &config.prefix, hasher),
            ledger: Ledger::new(&config.cache_dir, &config.prefix),
            config,
        };

        match engine.initialize_ledger() {
            Ok(()) => Ok(Some(engine)),
            Err(e) if e.is_permission_denied() => {
                warn!(dir = %engine.config.cache_dir.display(), error = %e, "cache directory not writable; cache unavailable");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Return the artifact cached for `resource_id`, producing it first if
    /// no process has cached it yet.
    ///
    /// `produce` is called at most once, only when this call becomes the
    /// writer; it receives a writer positioned after the id line. `consume`
    /// is called once with a reader positioned at the same place, on a hit or
    /// on the freshly written entry.
    pub fn lookup_or_create<T, P, C>(
        &self,
        resource_id: &str,
        produce: P,
        consume: C,
    ) -> CacheResult<Cached<T>>
    where
        P: FnOnce(&mut dyn Write) -> CacheResult<()>,
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        self.lookup(resource_id, None, produce, consume)
    }

    /// Like [`lookup_or_create`](Self::lookup_or_create), checking hits
    /// against the modification time of `source`.
    pub fn lookup_or_create_fresh<T, P, C>(
        &self,
        resource_id: &str,
        source: &Path,
        policy: StalePolicy,
        produce: P,
        consume: C,
    ) -> CacheResult<Cached<T>>
    where
        P: FnOnce(&mut dyn Write) -> CacheResult<()>,
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        self.lookup(resource_id, Some((source, policy)), produce, consume)
    }

    fn lookup<T, P, C>(
        &self,
        resource_id: &str,
        freshness: Option<(&Path, StalePolicy)>,
        produce: P,
        consume: C,
    ) -> CacheResult<Cached<T>>
    where
        P: FnOnce(&mut dyn Write) -> CacheResult<()>,
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        validate_resource_id(resource_id)?;
        let bucket = self.keys.derive(resource_id);
        debug!(resource_id, %bucket, "cache lookup");

        if self.config.collision_strategy == CollisionStrategy::ProbeFirst {
            for suffix in self.existing_suffixes(&bucket)? {
                let location = self.keys.location(&bucket, suffix);
                if let Slot::Hit { lock, header_len } =
                    self.resolve_slot(resource_id, &location.path, freshness, false)?
                {
                    return self.consume_entry(lock, header_len, location, Outcome::Hit, consume);
                }
            }
        }

        for suffix in 0..self.config.max_collisions {
            let location = self.keys.location(&bucket, suffix);
            match self.resolve_slot(resource_id, &location.path, freshness, true)? {
                Slot::Hit { lock, header_len } => {
                    debug!(path = %location, "cache hit");
                    return self.consume_entry(lock, header_len, location, Outcome::Hit, consume);
                }
                Slot::Vacant(lock) => {
                    return self.write_entry(lock, resource_id, location, produce, consume);
                }
                Slot::Occupied => {
                    debug!(path = %location, "bucket collision, trying next suffix");
                }
            }
        }

        Err(CacheError::CollisionCeilingExceeded {
            resource_id: resource_id.to_string(),
            attempts: self.config.max_collisions,
        })
    }

    /// Read the entry cached for `resource_id` without ever creating one.
    pub fn get<T, C>(&self, resource_id: &str, consume: C) -> CacheResult<Option<Cached<T>>>
    where
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        validate_resource_id(resource_id)?;
        let bucket = self.keys.derive(resource_id);

        for suffix in self.existing_suffixes(&bucket)? {
            let location = self.keys.location(&bucket, suffix);
            if let Probe::Match { lock, header_len } = self.probe(&location.path, resource_id)? {
                return self
                    .consume_entry(lock, header_len, location, Outcome::Hit, consume)
                    .map(Some);
            }
        }

        debug!(resource_id, %bucket, "cache miss");
        Ok(None)
    }

    /// Settle one candidate path: a hit, a vacancy we now own, or somebody
    /// else's entry.
    fn resolve_slot(
        &self,
        resource_id: &str,
        path: &Path,
        freshness: Option<(&Path, StalePolicy)>,
        may_create: bool,
    ) -> CacheResult<Slot> {
        let mut reclaim_attempts = 0;
        let mut accept_stale = false;

        loop {
            match self.probe(path, resource_id)? {
                Probe::Match { lock, header_len } => match freshness {
                    Some((source, policy)) if !accept_stale => {
                        let state = freshness_of(&lock.metadata()?, source);
                        let Freshness::Stale(reason) = state else {
                            return Ok(Slot::Hit { lock, header_len });
                        };

                        if policy == StalePolicy::Serve {
                            warn!(path = %path.display(), ?reason, "serving stale cache entry");
                            return Ok(Slot::Hit { lock, header_len });
                        }

                        drop(lock);
                        match self.remove_path(path)? {
                            RemoveOutcome::Removed { .. } => {
                                info!(path = %path.display(), ?reason, "removed stale cache entry");
                            }
                            outcome => {
                                warn!(path = %path.display(), ?reason, ?outcome, "stale cache entry could not be removed; serving it");
                                accept_stale = true;
                                continue;
                            }
                        }
                    }
                    _ => return Ok(Slot::Hit { lock, header_len }),
                },
                Probe::Collision => return Ok(Slot::Occupied),
                Probe::Orphan => {
                    if reclaim_attempts == ORPHAN_RECLAIM_ATTEMPTS {
                        warn!(path = %path.display(), "orphaned cache entry could not be reclaimed");
                        return Ok(Slot::Occupied);
                    }
                    reclaim_attempts += 1;
                    // Losing means another lookup is looking at the same
                    // orphan; it goes away or gets rewritten shortly.
                    if !self.reclaim_orphan(path)? {
                        debug!(path = %path.display(), "orphaned cache entry busy, probing again");
                        thread::sleep(ORPHAN_RECLAIM_BACKOFF);
                    }
                    continue;
                }
                Probe::Absent => {}
            }

            if !may_create {
                return Ok(Slot::Occupied);
            }

            if let Some(lock) = self.create_exclusive(path)? {
                return Ok(Slot::Vacant(lock));
            }

            // Lost the race to another writer: wait for its entry.
            debug!(path = %path.display(), "lost writer race, re-reading");
            return match self.probe(path, resource_id)? {
                Probe::Match { lock, header_len } => Ok(Slot::Hit { lock, header_len }),
                _ => Ok(Slot::Occupied),
            };
        }
    }

    /// Shared-lock the entry at `path` and compare its id line.
    fn probe(&self, path: &Path, resource_id: &str) -> CacheResult<Probe> {
        let Some(mut lock) = self.acquire_shared(path)? else {
            return Ok(Probe::Absent);
        };

        let header = read_header(lock.file_mut()).map_err(|e| CacheError::corrupt(path, e))?;
        match header {
            Header::Complete { id, len } if id == resource_id.as_bytes() => {
                Ok(Probe::Match { lock, header_len: len })
            }
            Header::Complete { .. } => Ok(Probe::Collision),
            Header::Incomplete => Ok(Probe::Orphan),
        }
    }

    fn acquire_shared(&self, path: &Path) -> CacheResult<Option<EntryLock>> {
        // Entries are created and locked under the exclusive coordination
        // lock, so a file opened under the shared one is never caught between
        // creation and its writer's lock.
        let opened = {
            let _coordination = self.ledger.lock_shared()?;
            OpenedEntry::open(path)?
        };

        let Some(opened) = opened else {
            return Ok(None);
        };

        let lock = match self.config.lock_timeout {
            Some(timeout) => opened.shared_with_timeout(timeout)?,
            None => opened.block_until_shared()?,
        };
        Ok(lock)
    }

    fn create_exclusive(&self, path: &Path) -> CacheResult<Option<EntryLock>> {
        let _coordination = self.ledger.lock_exclusive()?;
        Ok(EntryLock::try_create_exclusive(path)?)
    }

    fn write_entry<T, P, C>(
        &self,
        mut lock: EntryLock,
        resource_id: &str,
        location: EntryLocation,
        produce: P,
        consume: C,
    ) -> CacheResult<Cached<T>>
    where
        P: FnOnce(&mut dyn Write) -> CacheResult<()>,
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        debug!(resource_id, path = %location, "writing cache entry");

        let written = match fill_entry(lock.file_mut(), resource_id, produce) {
            Ok(written) => written,
            Err(e) => {
                // Unlink while still holding the exclusive lock; waiting
                // readers will see the inode is gone.
                if let Err(rm) = fs::remove_file(&location.path) {
                    warn!(path = %location, error = %rm, "failed to remove partial cache entry");
                }
                warn!(resource_id, path = %location, error = %e, "cache write failed; partial entry removed");
                return Err(e);
            }
        };

        match self.adjust_ledger_locked(|total| total.saturating_add(written)) {
            Ok(total) if total > self.config.size_limit_bytes => {
                if let Err(e) = self.run_purge_excluding(&location.path) {
                    warn!(error = %e, "cache purge failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to update cache ledger"),
        }

        {
            let _coordination = self.ledger.lock_shared()?;
            lock.downgrade()?;
        }

        info!(resource_id, path = %location, bytes = written, "cache entry published");

        let header_len = resource_id.len() as u64 + 1;
        self.consume_entry(lock, header_len, location, Outcome::Created, consume)
    }

    fn consume_entry<T, C>(
        &self,
        mut lock: EntryLock,
        header_len: u64,
        location: EntryLocation,
        outcome: Outcome,
        consume: C,
    ) -> CacheResult<Cached<T>>
    where
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        let file = lock.file_mut();
        file.seek(SeekFrom::Start(header_len))
            .map_err(|e| CacheError::corrupt(&location.path, e))?;

        let mut reader = BufReader::new(file);
        let value = consume(&mut reader).map_err(|e| {
            warn!(path = %location, error = %e, "failed to read cache entry");
            CacheError::corrupt(&location.path, e)
        })?;

        Ok(Cached {
            value,
            entry: location,
            outcome,
        })
    }

    /// Delete an entry left without a complete id line by a writer that
    /// died. Returns `true` if the path is worth probing again.
    fn reclaim_orphan(&self, path: &Path) -> CacheResult<bool> {
        let mut coordination = self.ledger.lock_exclusive()?;
        let Some(mut lock) = EntryLock::try_exclusive(path)? else {
            return Ok(false);
        };

        // Someone may have reclaimed and rewritten it since our probe.
        let header = read_header(lock.file_mut()).map_err(|e| CacheError::corrupt(path, e))?;
        if let Header::Complete { .. } = header {
            return Ok(true);
        }

        let bytes = lock.metadata()?.len();
        fs::remove_file(path)?;
        drop(lock);
        if bytes > 0 {
            self.adjust_ledger(&mut coordination, |total| total.saturating_sub(bytes))?;
        }
        warn!(path = %path.display(), bytes, "reclaimed orphaned cache entry");
        Ok(true)
    }

    /// Remove the entry cached for `resource_id`.
    pub fn remove(&self, resource_id: &str) -> CacheResult<RemoveOutcome> {
        validate_resource_id(resource_id)?;
        let bucket = self.keys.derive(resource_id);

        for suffix in self.existing_suffixes(&bucket)? {
            let location = self.keys.location(&bucket, suffix);
            if let Probe::Match { lock, .. } = self.probe(&location.path, resource_id)? {
                drop(lock);
                return self.remove_path(&location.path);
            }
        }

        Ok(RemoveOutcome::NotFound)
    }

    /// Remove the entry at `path`, unless someone holds it.
    pub fn remove_path(&self, path: &Path) -> CacheResult<RemoveOutcome> {
        self.check_entry_path(path)?;

        let mut coordination = self.ledger.lock_exclusive()?;
        let Some(lock) = EntryLock::try_exclusive(path)? else {
            let outcome = if path.exists() {
                RemoveOutcome::InUse
            } else {
                RemoveOutcome::NotFound
            };
            return Ok(outcome);
        };

        let bytes = lock.metadata()?.len();
        fs::remove_file(path)?;
        drop(lock);

        self.adjust_ledger(&mut coordination, |total| total.saturating_sub(bytes))?;
        debug!(path = %path.display(), bytes, "cache entry removed");
        Ok(RemoveOutcome::Removed { bytes })
    }

    /// Whether the entry at `entry_path` is still good relative to `source`.
    ///
    /// Stale means zero bytes, or `source` modified after the entry was
    /// written. A `source` that cannot be stat'ed compares as fresh.
    pub fn freshness(&self, entry_path: &Path, source: &Path) -> CacheResult<Freshness> {
        match fs::metadata(entry_path) {
            Ok(meta) => Ok(freshness_of(&meta, source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Freshness::Stale(StaleReason::Missing)),
            Err(e) => Err(e.into()),
        }
    }

    /// Resource id recorded in the entry at `path`, waiting for its writer
    /// if one is active. `None` if the entry is absent or incomplete.
    pub fn read_stored_id(&self, path: &Path) -> CacheResult<Option<String>> {
        self.check_entry_path(path)?;
        let Some(mut lock) = self.acquire_shared(path)? else {
            return Ok(None);
        };

        match read_header(lock.file_mut()).map_err(|e| CacheError::corrupt(path, e))? {
            Header::Complete { id, .. } => Ok(Some(String::from_utf8_lossy(&id).into_owned())),
            Header::Incomplete => Ok(None),
        }
    }

    /// Read the entry named `file_name` without knowing its resource id.
    ///
    /// Used to hand out entries by name (stored result tokens). `consume`
    /// sees the payload, after the id line. `None` if there is no such entry.
    pub fn read_entry<T, C>(&self, file_name: &str, consume: C) -> CacheResult<Option<Cached<T>>>
    where
        C: FnOnce(&mut dyn BufRead) -> io::Result<T>,
    {
        let Some(location) = self.keys.location_for_file_name(file_name) else {
            return Err(CacheError::NotAnEntry(self.keys.dir().join(file_name)));
        };

        let Some(mut lock) = self.acquire_shared(&location.path)? else {
            return Ok(None);
        };

        match read_header(lock.file_mut()).map_err(|e| CacheError::corrupt(&location.path, e))? {
            Header::Complete { len, .. } => self
                .consume_entry(lock, len, location, Outcome::Hit, consume)
                .map(Some),
            Header::Incomplete => Ok(None),
        }
    }

    /// Every entry file in the cache directory.
    pub fn entries(&self) -> CacheResult<Vec<EntryInfo>> {
        let mut entries = Vec::new();

        for item in WalkDir::new(self.keys.dir()).min_depth(1).max_depth(1) {
            let item = match item {
                Ok(item) => item,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            };

            if !item.file_type().is_file() {
                continue;
            }

            let Some(name) = item.file_name().to_str() else {
                continue;
            };
            let Some((bucket, suffix)) = self.keys.parse_file_name(name) else {
                continue;
            };

            let meta = match item.metadata() {
                Ok(meta) => meta,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            };

            entries.push(EntryInfo {
                location: EntryLocation {
                    bucket,
                    suffix,
                    path: item.path().to_path_buf(),
                },
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(entries)
    }

    /// Bytes used by entry files, by directory scan.
    pub fn disk_usage(&self) -> CacheResult<u64> {
        Ok(self.entries()?.iter().map(|e| e.size_bytes).sum())
    }

    /// Total recorded in the ledger.
    pub fn ledger_total(&self) -> CacheResult<Option<u64>> {
        self.ledger.lock_shared()?.read_total()
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.entries()?;
        Ok(CacheStats {
            entries: entries.len(),
            disk_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            ledger_bytes: self.ledger_total()?,
            size_limit_bytes: self.config.size_limit_bytes,
        })
    }

    /// Collision suffixes present on disk for `bucket`, ascending and below
    /// the ceiling.
    fn existing_suffixes(&self, bucket: &str) -> CacheResult<Vec<u32>> {
        let mut suffixes: Vec<u32> = self
            .entries()?
            .into_iter()
            .filter(|e| e.location.bucket == bucket && e.location.suffix < self.config.max_collisions)
            .map(|e| e.location.suffix)
            .collect();
        suffixes.sort_unstable();
        Ok(suffixes)
    }

    fn check_entry_path(&self, path: &Path) -> CacheResult<()> {
        let in_dir = path.parent() == Some(self.keys.dir());
        let is_entry = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.keys.is_entry_file(n));

        if in_dir && is_entry {
            Ok(())
        } else {
            Err(CacheError::NotAnEntry(path.to_path_buf()))
        }
    }

    fn initialize_ledger(&self) -> CacheResult<()> {
        let mut coordination = self.ledger.lock_exclusive()?;
        if coordination.read_total()?.is_none() {
            let total = self.disk_usage()?;
            coordination.write_total(total)?;
            info!(path = %self.ledger.path().display(), total_bytes = total, "cache ledger initialized");
        }
        Ok(())
    }

    /// Apply `update` to the ledger total. An unreadable ledger is replaced
    /// by a directory scan, which already reflects the change.
    fn adjust_ledger(
        &self,
        coordination: &mut LedgerGuard,
        update: impl FnOnce(u64) -> u64,
    ) -> CacheResult<u64> {
        let total = match coordination.read_total()? {
            Some(current) => update(current),
            None => self.disk_usage()?,
        };
        coordination.write_total(total)?;
        Ok(total)
    }

    fn adjust_ledger_locked(&self, update: impl FnOnce(u64) -> u64) -> CacheResult<u64> {
        let mut coordination = self.ledger.lock_exclusive()?;
        self.adjust_ledger(&mut coordination, update)
    }
}

/// Reject ids that cannot be stored as the entry's first line.
pub fn validate_resource_id(resource_id: &str) -> CacheResult<()> {
    if resource_id.is_empty() {
        return Err(CacheError::InvalidResourceId("empty".to_string()));
    }
    if resource_id.contains('\n') {
        return Err(CacheError::InvalidResourceId(format!(
            "contains a newline: {:?}",
            resource_id
        )));
    }
    if resource_id.len() > MAX_RESOURCE_ID_LEN {
        return Err(CacheError::InvalidResourceId(format!(
            "{} bytes exceeds the {} byte limit",
            resource_id.len(),
            MAX_RESOURCE_ID_LEN
        )));
    }
    Ok(())
}

fn freshness_of(entry: &fs::Metadata, source: &Path) -> Freshness {
    if entry.len() == 0 {
        return Freshness::Stale(StaleReason::Empty);
    }

    let entry_time = entry.modified().ok();
    let source_time = fs::metadata(source).and_then(|m| m.modified()).ok();

    match (entry_time, source_time) {
        (Some(entry_time), Some(source_time)) if source_time > entry_time => {
            Freshness::Stale(StaleReason::SourceNewer)
        }
        _ => Freshness::Fresh,
    }
}

/// Write the id line and the payload, then flush to disk. Returns the size
/// of the entry.
fn fill_entry<P>(file: &mut fs::File, resource_id: &str, produce: P) -> CacheResult<u64>
where
    P: FnOnce(&mut dyn Write) -> CacheResult<()>,
{
    {
        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(resource_id.as_bytes())?;
        writer.write_all(b"\n")?;
        produce(&mut writer)?;
        writer.flush()?;
    }
    file.sync_data()?;
    Ok(file.metadata()?.len())
}

fn read_header(file: &mut fs::File) -> io::Result<Header> {
    file.seek(SeekFrom::Start(0))?;
    let limit = MAX_RESOURCE_ID_LEN as u64 + 1;
    let mut reader = BufReader::new(Read::take(&mut *file, limit));

    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line)?;
    if read == 0 || line.last() != Some(&b'\n') {
        return Ok(Header::Incomplete);
    }

    line.pop();
    Ok(Header::Complete {
        id: line,
        len: read as u64,
    })
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
