//! dapcache - response cache for a scientific data access server
//!
//! Typed caches for dataset metadata responses, function results, stored
//! asynchronous results and fetched remote resources, all built on the
//! multi-process cache engine in `dapcache-engine`.

pub mod adapters;
pub mod cache_set;
pub mod config;
pub mod error;
pub mod payload;

pub use adapters::{
    FetchMeta, FunctionResponse, FunctionResponseCache, MetadataResponses, MetadataStore, RemoteFetcher,
    RemoteResource, RemoteResourceCache, StoredResult, StoredResultCache,
};
pub use cache_set::CacheSet;
pub use config::{CacheKind, CacheSection, CacheSettings, ConfigError};
pub use error::{AdapterError, AdapterResult, FetchError};
pub use payload::{DataResult, MetadataDoc, MetadataKind, Payload, RemoteBytes};

pub use dapcache_engine as engine;
