//! Global metadata store
//!
//! Keeps the DDS, DAS and DMR responses of each dataset so they are built
//! once and then served from disk. Every addition and removal is also
//! appended to an operations log next to the cache entries.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dapcache_engine::{CacheEngine, CacheError, Outcome, RemoveOutcome};
use tracing::{debug, info, warn};

use super::lookup_or_recreate;
use crate::error::AdapterResult;
use crate::payload::{MetadataDoc, MetadataKind, Payload};

/// Responses to add for one dataset. Absent ones are skipped.
#[derive(Debug, Clone, Default)]
pub struct MetadataResponses {
    pub dds: Option<String>,
    pub das: Option<String>,
    pub dmr: Option<String>,
}

impl MetadataResponses {
    fn get(&self, kind: MetadataKind) -> Option<&str> {
        match kind {
            MetadataKind::Dds => self.dds.as_deref(),
            MetadataKind::Das => self.das.as_deref(),
            MetadataKind::Dmr => self.dmr.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogOp {
    Add,
    Remove,
}

impl LogOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Store of per-dataset metadata responses.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    engine: Arc<CacheEngine>,
    log_path: PathBuf,
}

impl MetadataStore {
    /// Operations log file name suffix, appended to the cache prefix.
    pub const LOG_SUFFIX: &'static str = ".ledger";

    pub fn new(engine: Arc<CacheEngine>) -> Self {
        let keys = engine.keys();
        let log_path = keys.dir().join(format!("{}{}", keys.prefix(), Self::LOG_SUFFIX));
        Self { engine, log_path }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn resource_id(name: &str, kind: MetadataKind) -> String {
        format!("{}.{}", name, kind.id_suffix())
    }

    /// Store the given responses for dataset `name`.
    ///
    /// Returns `true` if at least one response was newly stored. Responses
    /// already in the store are left as they are.
    pub fn add_responses(&self, name: &str, responses: &MetadataResponses) -> AdapterResult<bool> {
        let mut added = Vec::new();

        for kind in MetadataKind::ALL {
            let Some(text) = responses.get(kind) else {
                continue;
            };

            let doc = Payload::Metadata(MetadataDoc {
                name: name.to_string(),
                kind,
                text: text.to_string(),
            });
            let cached = lookup_or_recreate(
                &self.engine,
                &Self::resource_id(name, kind),
                |w: &mut dyn Write| {
                    doc.write_to(w)?;
                    Ok(())
                },
                |r: &mut dyn BufRead| Payload::read_from(r)?.into_metadata(),
            )?;

            if cached.outcome == Outcome::Created {
                debug!(name, %kind, "metadata response stored");
                added.push(cached.entry.bucket);
            }
        }

        if added.is_empty() {
            return Ok(false);
        }

        self.append_log(LogOp::Add, name, &added);
        info!(name, responses = added.len(), "metadata responses added");
        Ok(true)
    }

    /// Stored response of `kind` for dataset `name`.
    ///
    /// A stored response that cannot be decoded is removed and reported as
    /// missing, so the next `add_responses` stores it again.
    pub fn get_response(&self, name: &str, kind: MetadataKind) -> AdapterResult<Option<MetadataDoc>> {
        let cached = self.engine.get(&Self::resource_id(name, kind), |r: &mut dyn BufRead| {
            Payload::read_from(r)?.into_metadata()
        });

        match cached {
            Ok(cached) => Ok(cached.map(|c| c.value)),
            Err(CacheError::Corrupt { path, source }) => {
                warn!(name, %kind, path = %path.display(), error = %source, "discarding corrupt metadata response");
                if let RemoveOutcome::InUse = self.engine.remove_path(&path)? {
                    debug!(path = %path.display(), "corrupt entry in use, left in place");
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy a stored response to `out`. Returns `false` if there is none.
    pub fn write_response(&self, name: &str, kind: MetadataKind, out: &mut dyn Write) -> AdapterResult<bool> {
        let Some(doc) = self.get_response(name, kind)? else {
            return Ok(false);
        };
        out.write_all(doc.text.as_bytes())?;
        Ok(true)
    }

    /// Remove every stored response of dataset `name`.
    ///
    /// Returns `true` if anything was removed. Responses in use by a reader
    /// stay in place.
    pub fn remove_responses(&self, name: &str) -> AdapterResult<bool> {
        let mut removed = Vec::new();

        for kind in MetadataKind::ALL {
            let resource_id = Self::resource_id(name, kind);
            match self.engine.remove(&resource_id)? {
                RemoveOutcome::Removed { .. } => removed.push(self.engine.keys().derive(&resource_id)),
                RemoveOutcome::InUse => warn!(name, %kind, "metadata response in use, not removed"),
                RemoveOutcome::NotFound => {}
            }
        }

        if removed.is_empty() {
            return Ok(false);
        }

        self.append_log(LogOp::Remove, name, &removed);
        info!(name, responses = removed.len(), "metadata responses removed");
        Ok(true)
    }

    /// Failures are logged, not returned.
    fn append_log(&self, op: LogOp, name: &str, buckets: &[String]) {
        let line = format!(
            "{} {} {} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            op.as_str(),
            name,
            buckets.join(",")
        );

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(e) = result {
            warn!(path = %self.log_path.display(), error = %e, "failed to append to metadata operations log");
        }
    }
}
