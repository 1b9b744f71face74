//! Adapter errors

use std::io;

use dapcache_engine::CacheError;
use thiserror::Error;

/// Adapter result type
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors from a remote fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the typed cache adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Cache(CacheError),

    /// The caller's computation failed; nothing was cached.
    #[error("computation failed: {0}")]
    Compute(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid stored result token '{0}'")]
    InvalidToken(String),

    #[error("empty URL")]
    EmptyUrl,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AdapterError {
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute(message.into())
    }
}

impl From<CacheError> for AdapterError {
    /// Errors raised inside a producer come back from the engine boxed;
    /// unwrap them to what the adapter originally raised.
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Producer(inner) => match inner.downcast::<AdapterError>() {
                Ok(adapter) => *adapter,
                Err(other) => Self::Compute(other.to_string()),
            },
            other => Self::Cache(other),
        }
    }
}
