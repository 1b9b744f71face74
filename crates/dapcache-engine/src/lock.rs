//! Advisory locks on cache entry files
//!
//! Every lock is bound to one open descriptor and is released when its guard
//! is dropped, so no exit path can leave an entry wedged.
//!
//! - Linux: open-file-description locks (`F_OFD_SETLK`). Converting an
//!   exclusive lock to a shared one is atomic, and two descriptors opened by
//!   the same process contend exactly like two processes.
//! - Other Unix targets: `flock(2)`. Conversion there is not atomic, so the
//!   engine only downgrades while holding the shared coordination lock.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock on {} is not held exclusively", .0.display())]
    NotExclusive(PathBuf),
}

/// Lock flavour held by a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers.
    Shared,
    /// One writer, excluding every other holder.
    Exclusive,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONTENTION_WARNING: Duration = Duration::from_millis(500);

/// A cache entry file that has been opened but not yet locked.
///
/// Splitting open from lock lets the engine open the file while it holds the
/// coordination lock and then wait for the entry lock without it.
#[derive(Debug)]
pub struct OpenedEntry {
    path: PathBuf,
    file: File,
}

impl OpenedEntry {
    /// Open an existing entry for reading. `None` if the path does not exist.
    pub fn open(path: &Path) -> LockResult<Option<Self>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self {
                path: path.to_path_buf(),
                file,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Block until a shared lock is granted.
    ///
    /// Returns `None` when the entry was unlinked while we waited: the writer
    /// gave up, or a purge removed it, and the name is free again.
    pub fn block_until_shared(self) -> LockResult<Option<EntryLock>> {
        sys::lock(&self.file, LockMode::Shared)?;
        self.into_shared()
    }

    /// Bounded variant of [`block_until_shared`](Self::block_until_shared).
    ///
    /// Polls for the lock and gives up with [`LockError::Timeout`] once
    /// `timeout` has elapsed. Contention longer than half a second is logged.
    pub fn shared_with_timeout(self, timeout: Duration) -> LockResult<Option<EntryLock>> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            if sys::try_lock(&self.file, LockMode::Shared)? {
                if warned {
                    debug!(
                        path = %self.path.display(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "shared lock acquired after contention"
                    );
                }
                return self.into_shared();
            }

            if !warned && start.elapsed() > CONTENTION_WARNING {
                warn!(path = %self.path.display(), "cache entry lock contention, waiting");
                warned = true;
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn into_shared(self) -> LockResult<Option<EntryLock>> {
        let lock = EntryLock {
            path: self.path,
            file: self.file,
            mode: LockMode::Shared,
        };
        if is_unlinked(&lock.file)? {
            debug!(path = %lock.path.display(), "entry unlinked while waiting for lock");
            return Ok(None);
        }
        Ok(Some(lock))
    }
}

/// Advisory lock on a single cache entry.
///
/// The lock is automatically released when this struct is dropped.
#[derive(Debug)]
pub struct EntryLock {
    path: PathBuf,
    file: File,
    mode: LockMode,
}

impl EntryLock {
    /// Create `path` and lock it exclusively, without blocking.
    ///
    /// `None` means the path already exists or someone else holds a lock on
    /// it; in both cases the caller is not the writer.
    pub fn try_create_exclusive(path: &Path) -> LockResult<Option<Self>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(LockError::Io(e)),
        };

        if !sys::try_lock(&file, LockMode::Exclusive)? {
            return Ok(None);
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            mode: LockMode::Exclusive,
        }))
    }

    /// Lock an existing entry exclusively, without blocking.
    ///
    /// `None` if the entry is absent or any other descriptor holds a shared
    /// or exclusive lock on it.
    pub fn try_exclusive(path: &Path) -> LockResult<Option<Self>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io(e)),
        };

        if !sys::try_lock(&file, LockMode::Exclusive)? {
            return Ok(None);
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            mode: LockMode::Exclusive,
        }))
    }

    /// Open `path` and block until a shared lock is granted.
    ///
    /// Returns `None` immediately when the path does not exist; a missing
    /// entry is a cache miss, never something to wait for.
    pub fn block_until_shared(path: &Path) -> LockResult<Option<Self>> {
        match OpenedEntry::open(path)? {
            Some(opened) => opened.block_until_shared(),
            None => Ok(None),
        }
    }

    /// Convert a held exclusive lock into a shared one without releasing it.
    pub fn downgrade(&mut self) -> LockResult<()> {
        if self.mode != LockMode::Exclusive {
            return Err(LockError::NotExclusive(self.path.clone()));
        }
        sys::downgrade(&self.file)?;
        self.mode = LockMode::Shared;
        Ok(())
    }

    /// Path of the locked entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lock mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Metadata of the locked descriptor (not of whatever the path names now).
    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        self.file.metadata()
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release entry lock");
        }
    }
}

/// Blocking lock on an already opened file. Used for the coordination lock.
pub(crate) fn lock_file(file: &File, mode: LockMode) -> io::Result<()> {
    sys::lock(file, mode)
}

pub(crate) fn unlock_file(file: &File) -> io::Result<()> {
    sys::unlock(file)
}

#[cfg(unix)]
fn is_unlinked(file: &File) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(file.metadata()?.nlink() == 0)
}

#[cfg(not(unix))]
fn is_unlinked(_file: &File) -> io::Result<bool> {
    Ok(false)
}

#[cfg(target_os = "linux")]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::LockMode;

    fn lock_type(mode: LockMode) -> libc::c_short {
        match mode {
            LockMode::Shared => libc::F_RDLCK as libc::c_short,
            LockMode::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }

    /// Apply an OFD lock over the whole file. Returns `false` when a
    /// non-blocking request conflicts with another holder.
    fn ofd(file: &File, l_type: libc::c_short, cmd: libc::c_int) -> io::Result<bool> {
        // SAFETY: `flock` is plain old data; all-zero is a valid value and
        // leaves l_start/l_len at 0 (whole file) and l_pid at 0 (required for OFD).
        let mut request: libc::flock = unsafe { std::mem::zeroed() };
        request.l_type = l_type;
        request.l_whence = libc::SEEK_SET as libc::c_short;

        loop {
            // SAFETY: the descriptor is owned by `file` and outlives the call.
            let rc = unsafe {
                libc::fcntl(file.as_raw_fd(), cmd, &mut request as *mut libc::flock)
            };
            if rc == 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if cmd == libc::F_OFD_SETLK => {
                    return Ok(false)
                }
                _ => return Err(err),
            }
        }
    }

    pub fn lock(file: &File, mode: LockMode) -> io::Result<()> {
        ofd(file, lock_type(mode), libc::F_OFD_SETLKW).map(|_| ())
    }

    pub fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
        ofd(file, lock_type(mode), libc::F_OFD_SETLK)
    }

    pub fn downgrade(file: &File) -> io::Result<()> {
        // Replacing a write lock with a read lock on the same description is
        // a single atomic fcntl call.
        ofd(file, libc::F_RDLCK as libc::c_short, libc::F_OFD_SETLKW).map(|_| ())
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        ofd(file, libc::F_UNLCK as libc::c_short, libc::F_OFD_SETLK).map(|_| ())
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::LockMode;

    fn flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
        loop {
            // SAFETY: the descriptor is owned by `file` and outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if rc == 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) if operation & libc::LOCK_NB != 0 => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    fn operation(mode: LockMode) -> libc::c_int {
        match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }

    pub fn lock(file: &File, mode: LockMode) -> io::Result<()> {
        flock(file, operation(mode)).map(|_| ())
    }

    pub fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
        flock(file, operation(mode) | libc::LOCK_NB)
    }

    pub fn downgrade(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_SH).map(|_| ())
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_UN).map(|_| ())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    use super::LockMode;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "advisory cache locks require a Unix platform",
        )
    }

    pub fn lock(_file: &File, _mode: LockMode) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn try_lock(_file: &File, _mode: LockMode) -> io::Result<bool> {
        Err(unsupported())
    }

    pub fn downgrade(_file: &File) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Err(unsupported())
    }
}
