//! dapcache CLI
//!
//! Operator commands over the caches of a server installation.

use clap::{Parser, Subcommand};
use dapcache::engine::{CacheEngine, RemoveOutcome};
use dapcache::{CacheKind, CacheSet, CacheSettings};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "dapcache")]
#[command(about = "Inspect and maintain dapcache cache directories", version)]
struct Cli {
    /// Path to site config file (TOML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the directory of every cache
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Override the size limit of every cache, in megabytes
    #[arg(long, global = true)]
    size_mb: Option<u64>,

    /// Log protocol steps
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entry counts and sizes
    Stats {
        /// Only this cache (function_response, metadata_store, stored_result, remote_resource)
        #[arg(long)]
        cache: Option<CacheKind>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Shrink caches to their purge target
    Purge {
        #[arg(long)]
        cache: Option<CacheKind>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// List entries with their resource ids
    Ls {
        #[arg(long)]
        cache: Option<CacheKind>,
    },

    /// Remove the entry cached for a resource id
    Remove {
        #[arg(long)]
        cache: CacheKind,

        resource_id: String,
    },

    /// Print the resolved configuration
    ShowConfig {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    };

    if let Commands::ShowConfig { json } = cli.command {
        run_show_config(&settings, json);
        return;
    }

    let caches = match CacheSet::open(&settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error opening caches: {}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Stats { cache, json } => run_stats(&caches, cache, json),
        Commands::Purge { cache, dry_run } => run_purge(&caches, cache, dry_run),
        Commands::Ls { cache } => run_ls(&caches, cache),
        Commands::Remove { cache, resource_id } => run_remove(&caches, cache, &resource_id),
        Commands::ShowConfig { .. } => {}
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn load_settings(cli: &Cli) -> Result<CacheSettings, dapcache::ConfigError> {
    let mut section = serde_json::Map::new();
    if let Some(ref dir) = cli.dir {
        section.insert("path".to_string(), serde_json::json!(dir));
    }
    if let Some(size_mb) = cli.size_mb {
        section.insert("size_mb".to_string(), serde_json::json!(size_mb));
    }

    let overrides = (!section.is_empty()).then(|| {
        let section = serde_json::Value::Object(section);
        let root: serde_json::Map<_, _> = CacheKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), section.clone()))
            .collect();
        serde_json::Value::Object(root)
    });

    CacheSettings::build(
        Some(Path::new(dapcache::config::DEFAULT_HOST_CONFIG)),
        cli.config.as_deref(),
        overrides,
    )
}

/// Available engines, one kind or all.
fn selected(caches: &CacheSet, only: Option<CacheKind>) -> Vec<(CacheKind, Option<&CacheEngine>)> {
    let kinds = match only {
        Some(kind) => vec![kind],
        None => CacheKind::ALL.to_vec(),
    };
    kinds
        .into_iter()
        .map(|kind| (kind, caches.engine(kind).map(|e| &**e)))
        .collect()
}

fn run_stats(caches: &CacheSet, only: Option<CacheKind>, json_output: bool) {
    let mut rows = Vec::new();

    for (kind, engine) in selected(caches, only) {
        let Some(engine) = engine else {
            rows.push(serde_json::json!({"cache": kind.as_str(), "available": false}));
            continue;
        };

        match engine.stats() {
            Ok(stats) => rows.push(serde_json::json!({
                "cache": kind.as_str(),
                "available": true,
                "dir": engine.config().cache_dir,
                "prefix": engine.config().prefix,
                "entries": stats.entries,
                "disk_bytes": stats.disk_bytes,
                "ledger_bytes": stats.ledger_bytes,
                "size_limit_bytes": stats.size_limit_bytes,
            })),
            Err(e) => {
                eprintln!("Error reading {} cache: {}", kind, e);
                process::exit(1);
            }
        }
    }

    if json_output {
        match serde_json::to_string_pretty(&rows) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    for row in rows {
        let name = row["cache"].as_str().unwrap_or_default();
        if row["available"] == false {
            println!("{}: unavailable", name);
            continue;
        }
        println!(
            "{} (dir {}, prefix {})",
            name,
            row["dir"].as_str().unwrap_or_default(),
            row["prefix"].as_str().unwrap_or_default()
        );
        println!("  Entries: {}", row["entries"]);
        println!("  Disk bytes: {}", row["disk_bytes"]);
        println!("  Ledger bytes: {}", row["ledger_bytes"]);
        println!("  Size limit: {}", row["size_limit_bytes"]);
    }
}

fn run_purge(caches: &CacheSet, only: Option<CacheKind>, dry_run: bool) {
    let mut failed = false;

    for (kind, engine) in selected(caches, only) {
        let Some(engine) = engine else {
            println!("{}: unavailable", kind);
            continue;
        };

        let result = if dry_run { engine.purge_dry_run() } else { engine.purge() };
        match result {
            Ok(report) => {
                let verb = if dry_run { "would delete" } else { "deleted" };
                println!(
                    "{}: {} {} of {} entries ({} bytes), skipped {}, {} bytes remaining",
                    kind, verb, report.deleted, report.scanned, report.bytes_reclaimed, report.skipped, report.bytes_remaining
                );
                for error in &report.errors {
                    eprintln!("  {}", error);
                }
            }
            Err(e) => {
                eprintln!("Error purging {} cache: {}", kind, e);
                failed = true;
            }
        }
    }

    if failed {
        process::exit(1);
    }
}

fn run_ls(caches: &CacheSet, only: Option<CacheKind>) {
    for (kind, engine) in selected(caches, only) {
        let Some(engine) = engine else {
            continue;
        };

        let mut entries = match engine.entries() {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("Error listing {} cache: {}", kind, e);
                process::exit(1);
            }
        };
        entries.sort_by(|a, b| a.location.path.cmp(&b.location.path));

        for entry in entries {
            let id = match engine.read_stored_id(&entry.location.path) {
                Ok(Some(id)) => id,
                Ok(None) => "<incomplete>".to_string(),
                Err(e) => format!("<error: {}>", e),
            };
            println!("{}\t{}\t{}\t{}", kind, entry.location.file_name(), entry.size_bytes, id);
        }
    }
}

fn run_remove(caches: &CacheSet, kind: CacheKind, resource_id: &str) {
    let Some(engine) = caches.engine(kind) else {
        eprintln!("The {} cache is unavailable.", kind);
        process::exit(1);
    };

    match engine.remove(resource_id) {
        Ok(RemoveOutcome::Removed { bytes }) => println!("Removed {} ({} bytes)", resource_id, bytes),
        Ok(RemoveOutcome::NotFound) => {
            eprintln!("Not cached: {}", resource_id);
            process::exit(1);
        }
        Ok(RemoveOutcome::InUse) => {
            eprintln!("Entry for {} is in use; try again later.", resource_id);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error removing {}: {}", resource_id, e);
            process::exit(1);
        }
    }
}

fn run_show_config(settings: &CacheSettings, json_output: bool) {
    if json_output {
        match settings.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    for kind in CacheKind::ALL {
        let section = settings.section(kind);
        println!("[{}]", kind);
        println!("  path = {}", section.path.display());
        println!("  prefix = {}", section.prefix);
        println!("  size_mb = {}", section.size_mb);
        println!("  max_collisions = {}", section.max_collisions);
        println!("  lock_timeout_seconds = {}", section.lock_timeout_seconds);
        println!("  collision_strategy = {}", section.collision_strategy.as_str());
        println!("  purge_target_ratio = {}", section.purge_target_ratio);
    }

    println!();
    println!("Sources:");
    for source in &settings.sources {
        match (&source.path, &source.digest) {
            (Some(path), Some(digest)) => println!("  {:?}: {} (sha256 {})", source.origin, path, digest),
            _ => println!("  {:?}", source.origin),
        }
    }
}
