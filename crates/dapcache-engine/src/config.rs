//! Cache engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default ceiling on collision suffixes tried per bucket.
pub const DEFAULT_MAX_COLLISIONS: u32 = 50;

/// Default fraction of the size limit a purge shrinks the cache to.
pub const DEFAULT_PURGE_TARGET_RATIO: f64 = 0.8;

/// How a lookup walks the collision suffixes of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionStrategy {
    /// One pass: at each suffix read, else try to write, else re-read.
    #[default]
    Interleaved,
    /// List the bucket's existing entries and look for a hit among all of
    /// them before any write is attempted, then fall back to the single pass.
    ProbeFirst,
}

impl CollisionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interleaved => "interleaved",
            Self::ProbeFirst => "probe_first",
        }
    }
}

/// Configuration for one cache directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the entries; must already exist
    pub cache_dir: PathBuf,
    /// File name prefix of every entry
    pub prefix: String,
    /// Size above which a write triggers a purge
    pub size_limit_bytes: u64,
    /// Number of collision suffixes tried per bucket
    pub max_collisions: u32,
    /// Bound on waiting for a shared lock (`None` blocks indefinitely)
    pub lock_timeout: Option<Duration>,
    pub collision_strategy: CollisionStrategy,
    /// Fraction of `size_limit_bytes` a purge shrinks the cache to
    pub purge_target_ratio: f64,
}

impl EngineConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, prefix: impl Into<String>, size_limit_bytes: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            prefix: prefix.into(),
            size_limit_bytes,
            max_collisions: DEFAULT_MAX_COLLISIONS,
            lock_timeout: None,
            collision_strategy: CollisionStrategy::default(),
            purge_target_ratio: DEFAULT_PURGE_TARGET_RATIO,
        }
    }

    pub fn with_max_collisions(mut self, max_collisions: u32) -> Self {
        self.max_collisions = max_collisions;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_collision_strategy(mut self, strategy: CollisionStrategy) -> Self {
        self.collision_strategy = strategy;
        self
    }

    pub fn with_purge_target_ratio(mut self, ratio: f64) -> Self {
        self.purge_target_ratio = ratio;
        self
    }

    /// Size a purge aims for.
    pub fn purge_target_bytes(&self) -> u64 {
        let ratio = self.purge_target_ratio.clamp(0.0, 1.0);
        (self.size_limit_bytes as f64 * ratio) as u64
    }

    /// Why a cache with this configuration cannot be used, if it cannot.
    pub fn unavailable_reason(&self) -> Option<String> {
        if self.cache_dir.as_os_str().is_empty() {
            return Some("cache directory not configured".to_string());
        }
        if !self.cache_dir.is_dir() {
            return Some(format!(
                "cache directory {} does not exist",
                self.cache_dir.display()
            ));
        }
        if self.prefix.is_empty() {
            return Some("cache prefix is empty".to_string());
        }
        if self.prefix.contains('/') {
            return Some(format!("cache prefix '{}' contains '/'", self.prefix));
        }
        if self.size_limit_bytes == 0 {
            return Some("cache size limit is zero".to_string());
        }
        if self.max_collisions == 0 {
            return Some("collision ceiling is zero".to_string());
        }
        None
    }
}
