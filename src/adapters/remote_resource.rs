//! Cache of resources fetched from remote URLs
//!
//! The fetch itself is behind [`RemoteFetcher`]; this adapter only decides
//! when to call it and keeps the body with its content type.

use std::io::{BufRead, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dapcache_engine::{CacheEngine, CacheError, Outcome};
use tracing::{debug, info};

use super::lookup_or_recreate;
use crate::error::{AdapterError, AdapterResult, FetchError};
use crate::payload::{Payload, RemoteBytes};

/// Response metadata reported by a fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMeta {
    /// Value of the `Content-Type` header
    pub content_type: Option<String>,
    /// Value of the `Content-Disposition` header
    pub content_disposition: Option<String>,
}

/// Retrieves the body of a URL.
pub trait RemoteFetcher: Send + Sync {
    /// Write the body of `url` to `sink`.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<FetchMeta, FetchError>;
}

/// A remote resource, fetched now or earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub url: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub outcome: Outcome,
}

pub struct RemoteResourceCache {
    engine: Arc<CacheEngine>,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl RemoteResourceCache {
    pub fn new(engine: Arc<CacheEngine>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { engine, fetcher }
    }

    /// Return the resource at `url`, fetching it if no one has yet.
    pub fn retrieve(&self, url: &str) -> AdapterResult<RemoteResource> {
        if url.is_empty() {
            return Err(AdapterError::EmptyUrl);
        }

        let cached = lookup_or_recreate(
            &self.engine,
            url,
            |w: &mut dyn Write| {
                let remote = self.fetch(url).map_err(CacheError::producer)?;
                Payload::Remote(remote).write_to(w)?;
                Ok(())
            },
            |r: &mut dyn BufRead| Payload::read_from(r)?.into_remote(),
        )?;

        let remote = cached.value;
        Ok(RemoteResource {
            url: remote.url,
            content_type: remote.content_type,
            bytes: remote.bytes,
            fetched_at: remote.fetched_at,
            outcome: cached.outcome,
        })
    }

    fn fetch(&self, url: &str) -> AdapterResult<RemoteBytes> {
        debug!(url, "fetching remote resource");
        let mut bytes = Vec::new();
        let meta = self.fetcher.fetch(url, &mut bytes)?;
        let content_type = resolve_content_type(url, &meta);

        info!(url, %content_type, bytes = bytes.len(), "remote resource fetched");
        Ok(RemoteBytes {
            url: url.to_string(),
            content_type,
            fetched_at: Utc::now(),
            bytes,
        })
    }
}

/// Content type from, in order: the disposition file name, the
/// `Content-Type` header, the URL path. Falls back to
/// `application/octet-stream`.
pub fn resolve_content_type(url: &str, meta: &FetchMeta) -> String {
    let from_disposition = meta
        .content_disposition
        .as_deref()
        .and_then(disposition_file_name)
        .and_then(type_from_extension);
    if let Some(t) = from_disposition {
        return t.to_string();
    }

    if let Some(ct) = meta.content_type.as_deref() {
        let essence = ct.split(';').next().unwrap_or_default().trim();
        if !essence.is_empty() {
            return essence.to_lowercase();
        }
    }

    type_from_url(url)
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn disposition_file_name(disposition: &str) -> Option<&str> {
    disposition
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"'))
}

fn type_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    type_from_extension(last)
}

fn type_from_extension(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let media_type = match ext.to_lowercase().as_str() {
        "nc" | "nc4" => "application/x-netcdf",
        "h5" | "hdf5" | "he5" => "application/x-hdf5",
        "hdf" | "h4" => "application/x-hdf",
        "dmrpp" | "xml" => "application/xml",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "txt" | "csv" => "text/plain",
        "gz" => "application/gzip",
        _ => return None,
    };
    Some(media_type)
}
