//! Layered cache configuration
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. Host config (/etc/dapcache/cache.toml)
//! 3. Site config (`--config`)
//! 4. CLI flags

mod defaults;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, SectionDefaults};
pub use merge::{deep_merge, merge_layers};
pub use settings::{
    CacheKind, CacheSection, CacheSettings, ConfigError, ConfigOrigin, ConfigSource,
    DEFAULT_HOST_CONFIG,
};
