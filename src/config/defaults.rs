//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

use dapcache_engine::{DEFAULT_MAX_COLLISIONS, DEFAULT_PURGE_TARGET_RATIO};

/// Default values shared by every cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDefaults {
    /// Cache directory (default: "/tmp/")
    pub path: String,

    /// Size limit in megabytes (default: 20480)
    pub size_mb: u64,

    /// Collision suffixes per bucket (default: 50)
    pub max_collisions: u32,

    /// Shared lock wait bound, 0 for none (default: 0)
    pub lock_timeout_seconds: u64,

    /// Collision walk (default: "interleaved")
    pub collision_strategy: String,

    /// Purge target as a fraction of the size limit (default: 0.8)
    pub purge_target_ratio: f64,
}

impl Default for SectionDefaults {
    fn default() -> Self {
        Self {
            path: "/tmp/".to_string(),
            size_mb: 20480,
            max_collisions: DEFAULT_MAX_COLLISIONS,
            lock_timeout_seconds: 0,
            collision_strategy: "interleaved".to_string(),
            purge_target_ratio: DEFAULT_PURGE_TARGET_RATIO,
        }
    }
}

/// Built-in default configuration values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    pub section: SectionDefaults,
}

impl BuiltinDefaults {
    /// Entry prefixes, one per cache section.
    pub const PREFIXES: [(&'static str, &'static str); 4] = [
        ("function_response", "rc"),
        ("metadata_store", "mds"),
        ("stored_result", "result_"),
        ("remote_resource", "rr"),
    ];

    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for (section, prefix) in Self::PREFIXES {
            root.insert(
                section.to_string(),
                serde_json::json!({
                    "path": self.section.path,
                    "prefix": prefix,
                    "size_mb": self.section.size_mb,
                    "max_collisions": self.section.max_collisions,
                    "lock_timeout_seconds": self.section.lock_timeout_seconds,
                    "collision_strategy": self.section.collision_strategy,
                    "purge_target_ratio": self.section.purge_target_ratio,
                }),
            );
        }
        serde_json::Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.section.path, "/tmp/");
        assert_eq!(defaults.section.size_mb, 20480);
        assert_eq!(defaults.section.max_collisions, 50);
        assert_eq!(defaults.section.lock_timeout_seconds, 0);
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["function_response"]["prefix"], "rc");
        assert_eq!(value["metadata_store"]["prefix"], "mds");
        assert_eq!(value["stored_result"]["prefix"], "result_");
        assert_eq!(value["remote_resource"]["prefix"], "rr");
        assert_eq!(value["remote_resource"]["size_mb"], 20480);
        assert_eq!(value["function_response"]["collision_strategy"], "interleaved");
    }
}
