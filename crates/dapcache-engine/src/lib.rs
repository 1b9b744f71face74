//! dapcache engine
//!
//! A disk cache shared by cooperating processes. Entries are files named by
//! a hash of their resource id; file locks make sure each artifact is
//! produced once and never read while half written, and a ledger file keeps
//! the directory under its size limit.

pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod ledger;
pub mod lock;
pub mod purge;

pub use config::{CollisionStrategy, EngineConfig, DEFAULT_MAX_COLLISIONS, DEFAULT_PURGE_TARGET_RATIO};
pub use engine::{
    validate_resource_id, CacheEngine, CacheStats, Cached, EntryInfo, Freshness, Outcome,
    RemoveOutcome, StalePolicy, StaleReason, MAX_RESOURCE_ID_LEN,
};
pub use error::{CacheError, CacheResult};
pub use key::{BucketHasher, EntryLocation, KeyDeriver, Sha256Hasher};
pub use ledger::{Ledger, LedgerGuard, LedgerRecord};
pub use lock::{EntryLock, LockError, LockMode, LockResult, OpenedEntry};
pub use purge::PurgeReport;
