//! Stored results for asynchronous responses
//!
//! A result is computed once and kept under its entry file name. The file
//! name is handed to the client as a token; a later request presents the
//! token and is answered from the stored entry.

use std::io::{BufRead, Write};
use std::sync::Arc;

use dapcache_engine::{CacheEngine, CacheError, Outcome};
use tracing::debug;

use super::lookup_or_recreate;
use crate::error::{AdapterError, AdapterResult};
use crate::payload::{DataResult, Payload};

/// Default entry prefix for stored results.
pub const DEFAULT_PREFIX: &str = "result_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    /// Entry file name, usable with [`StoredResultCache::load_result`]
    pub token: String,
    pub result: DataResult,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct StoredResultCache {
    engine: Arc<CacheEngine>,
}

impl StoredResultCache {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine }
    }

    pub fn resource_id(dataset: &str, constraint: &str) -> String {
        format!("{}#{}", dataset, constraint)
    }

    /// Store the result of `constraint` on `dataset`, computing it only if
    /// it is not stored yet.
    pub fn store_result<F>(&self, dataset: &str, constraint: &str, compute: F) -> AdapterResult<StoredResult>
    where
        F: FnOnce() -> AdapterResult<DataResult>,
    {
        let cached = lookup_or_recreate(
            &self.engine,
            &Self::resource_id(dataset, constraint),
            |w: &mut dyn Write| {
                let result = compute().map_err(CacheError::producer)?;
                Payload::Data(result).write_to(w)?;
                Ok(())
            },
            |r: &mut dyn BufRead| Payload::read_from(r)?.into_data(),
        )?;

        let token = cached.entry.file_name();
        debug!(dataset, %token, outcome = ?cached.outcome, "stored result");
        Ok(StoredResult {
            token,
            result: cached.value,
            outcome: cached.outcome,
        })
    }

    /// Result stored under `token`, or `None` if it has been purged.
    pub fn load_result(&self, token: &str) -> AdapterResult<Option<DataResult>> {
        let loaded = self
            .engine
            .read_entry(token, |r: &mut dyn BufRead| Payload::read_from(r)?.into_data());

        match loaded {
            Ok(cached) => Ok(cached.map(|c| c.value)),
            Err(CacheError::NotAnEntry(_)) => Err(AdapterError::InvalidToken(token.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dapcache_engine::EngineConfig;
    use tempfile::TempDir;

    fn cache(temp_dir: &TempDir) -> StoredResultCache {
        let engine = CacheEngine::open(EngineConfig::new(temp_dir.path(), DEFAULT_PREFIX, 1 << 20))
            .unwrap()
            .unwrap();
        StoredResultCache::new(Arc::new(engine))
    }

    #[test]
    fn test_store_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cache = cache(&temp_dir);

        let stored = cache
            .store_result("sst.nc", "sst[0:1:3]", || Ok(DataResult::new("application/octet-stream", vec![1, 2, 3])))
            .unwrap();
        assert!(stored.token.starts_with(DEFAULT_PREFIX));
        assert_eq!(stored.outcome, Outcome::Created);

        let loaded = cache.load_result(&stored.token).unwrap().unwrap();
        assert_eq!(loaded, stored.result);
    }

    #[test]
    fn test_same_request_same_token() {
        let temp_dir = TempDir::new().unwrap();
        let cache = cache(&temp_dir);
        let compute = || Ok(DataResult::new("text/plain", b"r".to_vec()));

        let first = cache.store_result("sst.nc", "sst", compute).unwrap();
        let second = cache.store_result("sst.nc", "sst", || panic!("computed twice")).unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(second.outcome, Outcome::Hit);
    }

    #[test]
    fn test_load_unknown_and_invalid_tokens() {
        let temp_dir = TempDir::new().unwrap();
        let cache = cache(&temp_dir);

        assert!(cache.load_result("result_0123456789abcdef_0").unwrap().is_none());
        assert!(matches!(
            cache.load_result("../../etc/passwd"),
            Err(AdapterError::InvalidToken(_))
        ));
        assert!(matches!(
            cache.load_result("result_.cache_info"),
            Err(AdapterError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_truncated_result_is_recomputed() {
        let temp_dir = TempDir::new().unwrap();
        let cache = cache(&temp_dir);
        let compute = || Ok(DataResult::new("application/octet-stream", vec![9u8; 500]));

        let first = cache.store_result("sst.nc", "sst", compute).unwrap();
        let path = temp_dir.path().join(&first.token);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(file.metadata().unwrap().len() - 100).unwrap();
        assert!(cache.load_result(&first.token).is_err());

        let second = cache.store_result("sst.nc", "sst", compute).unwrap();
        assert_eq!(second.outcome, Outcome::Created);
        assert_eq!(second.token, first.token);
        assert_eq!(cache.load_result(&second.token).unwrap().unwrap().bytes, vec![9u8; 500]);
    }
}
