//! The caches of one server process
//!
//! Opened once from the settings and kept for the life of the process.
//! Each cache may be unavailable, in which case its adapter is absent (or,
//! for function responses, computes everything directly).

use std::sync::Arc;

use dapcache_engine::{CacheEngine, CacheResult};

use crate::adapters::{FunctionResponseCache, MetadataStore, RemoteFetcher, RemoteResourceCache, StoredResultCache};
use crate::config::{CacheKind, CacheSettings};

#[derive(Debug, Clone)]
pub struct CacheSet {
    function_response: Option<Arc<CacheEngine>>,
    metadata_store: Option<Arc<CacheEngine>>,
    stored_result: Option<Arc<CacheEngine>>,
    remote_resource: Option<Arc<CacheEngine>>,
}

impl CacheSet {
    pub fn open(settings: &CacheSettings) -> CacheResult<Self> {
        let open = |kind: CacheKind| -> CacheResult<Option<Arc<CacheEngine>>> {
            Ok(CacheEngine::open(settings.engine_config(kind))?.map(Arc::new))
        };

        Ok(Self {
            function_response: open(CacheKind::FunctionResponse)?,
            metadata_store: open(CacheKind::MetadataStore)?,
            stored_result: open(CacheKind::StoredResult)?,
            remote_resource: open(CacheKind::RemoteResource)?,
        })
    }

    /// Engine behind a cache, if it is available.
    pub fn engine(&self, kind: CacheKind) -> Option<&Arc<CacheEngine>> {
        match kind {
            CacheKind::FunctionResponse => self.function_response.as_ref(),
            CacheKind::MetadataStore => self.metadata_store.as_ref(),
            CacheKind::StoredResult => self.stored_result.as_ref(),
            CacheKind::RemoteResource => self.remote_resource.as_ref(),
        }
    }

    pub fn function_responses(&self) -> FunctionResponseCache {
        FunctionResponseCache::new(self.function_response.clone())
    }

    pub fn metadata_store(&self) -> Option<MetadataStore> {
        self.metadata_store.clone().map(MetadataStore::new)
    }

    pub fn stored_results(&self) -> Option<StoredResultCache> {
        self.stored_result.clone().map(StoredResultCache::new)
    }

    pub fn remote_resources(&self, fetcher: Arc<dyn RemoteFetcher>) -> Option<RemoteResourceCache> {
        self.remote_resource
            .clone()
            .map(|engine| RemoteResourceCache::new(engine, fetcher))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_with_shared_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();
        let cli = serde_json::json!({
            "function_response": {"path": dir},
            "metadata_store": {"path": dir},
            "stored_result": {"path": dir, "size_mb": 0},
            "remote_resource": {"path": ""}
        });
        let settings = CacheSettings::build(None, None, Some(cli)).unwrap();

        let caches = CacheSet::open(&settings).unwrap();

        assert!(caches.function_responses().is_available());
        assert!(caches.metadata_store().is_some());
        assert!(caches.stored_results().is_none());
        assert!(caches.engine(CacheKind::RemoteResource).is_none());
        assert!(temp_dir.path().join("rc.cache_info").exists());
        assert!(temp_dir.path().join("mds.cache_info").exists());
        assert!(!temp_dir.path().join("result_.cache_info").exists());
    }
}
