//! Cache of server function results
//!
//! A request whose constraint calls server functions is expensive to
//! evaluate, so its result is cached under `<dataset>#<constraint>`. Entries
//! are checked against the dataset file: if the dataset changed after the
//! result was written, the result is regenerated.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use dapcache_engine::{CacheEngine, CacheError, Outcome, RemoveOutcome, StalePolicy};
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::payload::{DataResult, Payload};

/// Longest `dataset + constraint` that is cached.
pub const MAX_CACHEABLE_LEN: usize = 4096;

/// Cache for function-call responses keyed by dataset and constraint.
#[derive(Debug, Clone)]
pub struct FunctionResponseCache {
    engine: Option<Arc<CacheEngine>>,
}

/// A function result and whether it came from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionResponse {
    pub result: DataResult,
    /// `None` when the result was computed without the cache.
    pub outcome: Option<Outcome>,
}

impl FunctionResponseCache {
    /// `engine` is `None` when the cache is unavailable; every request is
    /// then computed directly.
    pub fn new(engine: Option<Arc<CacheEngine>>) -> Self {
        Self { engine }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    pub fn resource_id(dataset: &str, constraint: &str) -> String {
        format!("{}#{}", dataset, constraint)
    }

    /// Whether a request is small enough to be cached.
    pub fn can_be_cached(&self, dataset: &str, constraint: &str) -> bool {
        self.engine.is_some()
            && dataset.len() + constraint.len() <= MAX_CACHEABLE_LEN
            && !dataset.contains('\n')
            && !constraint.contains('\n')
    }

    /// Return the result for `constraint` on `dataset`, computing it with
    /// `compute` unless another request already cached it.
    pub fn get_or_compute<F>(&self, dataset: &str, constraint: &str, compute: F) -> AdapterResult<FunctionResponse>
    where
        F: FnOnce() -> AdapterResult<DataResult>,
    {
        let Some(engine) = self.engine.as_ref().filter(|_| self.can_be_cached(dataset, constraint)) else {
            debug!(dataset, "function response not cacheable, computing directly");
            return Ok(FunctionResponse {
                result: compute()?,
                outcome: None,
            });
        };

        let resource_id = Self::resource_id(dataset, constraint);
        let cached = engine.lookup_or_create_fresh(
            &resource_id,
            Path::new(dataset),
            StalePolicy::Regenerate,
            |w: &mut dyn Write| {
                let result = compute().map_err(CacheError::producer)?;
                Payload::Data(result).write_to(w)?;
                Ok(())
            },
            |r: &mut dyn BufRead| Payload::read_from(r)?.into_data(),
        );

        match cached {
            Ok(cached) => Ok(FunctionResponse {
                outcome: Some(cached.outcome),
                result: cached.value,
            }),
            Err(CacheError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "discarding corrupt function response");
                if let Ok(RemoveOutcome::InUse) = engine.remove_path(&path) {
                    debug!(path = %path.display(), "corrupt entry in use, left in place");
                }
                Err(AdapterError::Cache(CacheError::Corrupt { path, source }))
            }
            Err(e) => Err(e.into()),
        }
    }
}
