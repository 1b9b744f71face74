//! Resolved cache settings with provenance
//!
//! The merged layers are deserialized into one [`CacheSection`] per cache
//! and validated. Each contributing file is recorded with its digest.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dapcache_engine::{CollisionStrategy, EngineConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;

/// Host-wide configuration file, read when present.
pub const DEFAULT_HOST_CONFIG: &str = "/etc/dapcache/cache.toml";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Site,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// The four caches a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    FunctionResponse,
    MetadataStore,
    StoredResult,
    RemoteResource,
}

impl CacheKind {
    pub const ALL: [CacheKind; 4] = [
        Self::FunctionResponse,
        Self::MetadataStore,
        Self::StoredResult,
        Self::RemoteResource,
    ];

    /// TOML section name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionResponse => "function_response",
            Self::MetadataStore => "metadata_store",
            Self::StoredResult => "stored_result",
            Self::RemoteResource => "remote_resource",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown cache '{}' (expected one of: function_response, metadata_store, stored_result, remote_resource)",
                    s
                )
            })
    }
}

/// Settings of one cache directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Cache directory; empty disables the cache
    pub path: PathBuf,
    /// Entry file name prefix (lowercased)
    pub prefix: String,
    /// Size limit in megabytes; 0 disables the cache
    pub size_mb: u64,
    pub max_collisions: u32,
    /// Bound on waiting for a shared lock; 0 waits indefinitely
    pub lock_timeout_seconds: u64,
    pub collision_strategy: CollisionStrategy,
    pub purge_target_ratio: f64,
}

impl CacheSection {
    /// Engine configuration for this section.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(
            &self.path,
            &self.prefix,
            self.size_mb.saturating_mul(BYTES_PER_MB),
        )
        .with_max_collisions(self.max_collisions)
        .with_collision_strategy(self.collision_strategy)
        .with_purge_target_ratio(self.purge_target_ratio);

        if self.lock_timeout_seconds > 0 {
            config = config.with_lock_timeout(Duration::from_secs(self.lock_timeout_seconds));
        }
        config
    }

    fn validate(&self, kind: CacheKind) -> Result<(), ConfigError> {
        if self.prefix.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "{}.prefix must not contain '/': '{}'",
                kind, self.prefix
            )));
        }
        if !(self.purge_target_ratio > 0.0 && self.purge_target_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "{}.purge_target_ratio must be in (0, 1], got {}",
                kind, self.purge_target_ratio
            )));
        }
        if self.max_collisions == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}.max_collisions must be at least 1",
                kind
            )));
        }
        Ok(())
    }
}

/// Cache settings with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub function_response: CacheSection,
    pub metadata_store: CacheSection,
    pub stored_result: CacheSection,
    pub remote_resource: CacheSection,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
}

#[derive(Deserialize)]
struct Sections {
    function_response: CacheSection,
    metadata_store: CacheSection,
    stored_result: CacheSection,
    remote_resource: CacheSection,
}

impl CacheSettings {
    /// Built-in defaults only.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::build(None, None, None)
    }

    /// Build settings from layers. Missing files are skipped.
    pub fn build(
        host_config_path: Option<&Path>,
        site_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Site, site_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let mut sections: Sections = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        for section in [
            &mut sections.function_response,
            &mut sections.metadata_store,
            &mut sections.stored_result,
            &mut sections.remote_resource,
        ] {
            section.prefix = section.prefix.to_lowercase();
        }

        let settings = Self {
            function_response: sections.function_response,
            metadata_store: sections.metadata_store,
            stored_result: sections.stored_result,
            remote_resource: sections.remote_resource,
            sources,
        };
        for kind in CacheKind::ALL {
            settings.section(kind).validate(kind)?;
        }
        Ok(settings)
    }

    pub fn section(&self, kind: CacheKind) -> &CacheSection {
        match kind {
            CacheKind::FunctionResponse => &self.function_response,
            CacheKind::MetadataStore => &self.metadata_store,
            CacheKind::StoredResult => &self.stored_result,
            CacheKind::RemoteResource => &self.remote_resource,
        }
    }

    pub fn engine_config(&self, kind: CacheKind) -> EngineConfig {
        self.section(kind).engine_config()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Load and parse a TOML file, returning the value and digest
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;

    let toml_value: toml::Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

    Ok((toml_to_json(toml_value), digest))
}

/// Convert TOML Value to JSON Value
fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_only() {
        let settings = CacheSettings::defaults().unwrap();

        assert_eq!(settings.function_response.prefix, "rc");
        assert_eq!(settings.metadata_store.prefix, "mds");
        assert_eq!(settings.stored_result.prefix, "result_");
        assert_eq!(settings.remote_resource.prefix, "rr");
        assert_eq!(settings.function_response.path, PathBuf::from("/tmp/"));
        assert_eq!(settings.sources.len(), 1);
        assert_eq!(settings.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_engine_config() {
        let settings = CacheSettings::build(
            None,
            None,
            Some(serde_json::json!({
                "stored_result": {"size_mb": 2, "lock_timeout_seconds": 30, "collision_strategy": "probe_first"}
            })),
        )
        .unwrap();

        let config = settings.engine_config(CacheKind::StoredResult);
        assert_eq!(config.size_limit_bytes, 2 * 1024 * 1024);
        assert_eq!(config.lock_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.collision_strategy, CollisionStrategy::ProbeFirst);
        assert_eq!(config.prefix, "result_");

        let unbounded = settings.engine_config(CacheKind::MetadataStore);
        assert_eq!(unbounded.lock_timeout, None);
    }

    #[test]
    fn test_prefix_lowercased() {
        let cli = serde_json::json!({"function_response": {"prefix": "RC"}});
        let settings = CacheSettings::build(None, None, Some(cli)).unwrap();
        assert_eq!(settings.function_response.prefix, "rc");
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            serde_json::json!({"metadata_store": {"prefix": "a/b"}}),
            serde_json::json!({"metadata_store": {"purge_target_ratio": 0.0}}),
            serde_json::json!({"metadata_store": {"purge_target_ratio": 1.5}}),
            serde_json::json!({"metadata_store": {"max_collisions": 0}}),
            serde_json::json!({"metadata_store": {"collision_strategy": "lru"}}),
        ];

        for cli in cases {
            let err = CacheSettings::build(None, None, Some(cli.clone())).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{cli}: {err}");
        }
    }

    #[test]
    fn test_layers_from_files() {
        let mut host = NamedTempFile::new().unwrap();
        writeln!(host, "[function_response]").unwrap();
        writeln!(host, "path = \"/var/cache/host\"").unwrap();
        writeln!(host, "size_mb = 100").unwrap();

        let mut site = NamedTempFile::new().unwrap();
        writeln!(site, "[function_response]").unwrap();
        writeln!(site, "size_mb = 50").unwrap();

        let settings = CacheSettings::build(
            Some(host.path()),
            Some(site.path()),
            Some(serde_json::json!({"function_response": {"prefix": "fr"}})),
        )
        .unwrap();

        assert_eq!(settings.function_response.path, PathBuf::from("/var/cache/host"));
        assert_eq!(settings.function_response.size_mb, 50);
        assert_eq!(settings.function_response.prefix, "fr");
        assert_eq!(settings.metadata_store.size_mb, 20480);

        let origins: Vec<_> = settings.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![ConfigOrigin::Builtin, ConfigOrigin::Host, ConfigOrigin::Site, ConfigOrigin::Cli]
        );
        assert_eq!(settings.sources[1].digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let settings =
            CacheSettings::build(Some(Path::new("/nonexistent/dapcache.toml")), None, None).unwrap();
        assert_eq!(settings.sources.len(), 1);
    }

    #[test]
    fn test_bad_toml() {
        let mut site = NamedTempFile::new().unwrap();
        writeln!(site, "[function_response").unwrap();

        let err = CacheSettings::build(None, Some(site.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_cache_kind_parse() {
        assert_eq!("stored-result".parse::<CacheKind>(), Ok(CacheKind::StoredResult));
        assert_eq!("METADATA_STORE".parse::<CacheKind>(), Ok(CacheKind::MetadataStore));
        assert!("bes".parse::<CacheKind>().is_err());
    }
}
