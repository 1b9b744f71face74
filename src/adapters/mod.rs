//! Typed cache adapters
//!
//! Each adapter derives resource ids for its domain and stores its values
//! through the payload codec. None of them holds a lock beyond one call.

pub mod function_response;
pub mod metadata_store;
pub mod remote_resource;
pub mod stored_result;

pub use function_response::{FunctionResponse, FunctionResponseCache, MAX_CACHEABLE_LEN};
pub use metadata_store::{MetadataResponses, MetadataStore};
pub use remote_resource::{resolve_content_type, FetchMeta, RemoteFetcher, RemoteResource, RemoteResourceCache};
pub use stored_result::{StoredResult, StoredResultCache};

use std::io::{self, BufRead, Write};

use dapcache_engine::{CacheEngine, CacheError, CacheResult, Cached, RemoveOutcome};
use tracing::{debug, warn};

/// `lookup_or_create` that gets past a corrupt entry.
///
/// A hit that fails to decode is removed and the lookup runs once more, so
/// `produce` can write a good copy. If `produce` already ran for the entry
/// that failed to decode, the error is returned as is.
pub(crate) fn lookup_or_recreate<T, P, C>(
    engine: &CacheEngine,
    resource_id: &str,
    produce: P,
    consume: C,
) -> CacheResult<Cached<T>>
where
    P: FnOnce(&mut dyn Write) -> CacheResult<()>,
    C: Fn(&mut dyn BufRead) -> io::Result<T>,
{
    let mut produce = Some(produce);

    let first = engine.lookup_or_create(resource_id, |w: &mut dyn Write| produce_once(&mut produce, w), &consume);
    let path = match first {
        Err(CacheError::Corrupt { path, source }) if produce.is_some() => {
            warn!(resource_id, path = %path.display(), error = %source, "discarding corrupt cache entry");
            path
        }
        other => return other,
    };

    if let RemoveOutcome::InUse = engine.remove_path(&path)? {
        debug!(path = %path.display(), "corrupt entry in use, left in place");
    }

    engine.lookup_or_create(resource_id, |w: &mut dyn Write| produce_once(&mut produce, w), &consume)
}

fn produce_once<P>(produce: &mut Option<P>, w: &mut dyn Write) -> CacheResult<()>
where
    P: FnOnce(&mut dyn Write) -> CacheResult<()>,
{
    match produce.take() {
        Some(produce) => produce(w),
        None => Err(io::Error::new(io::ErrorKind::Other, "entry producer already ran").into()),
    }
}
