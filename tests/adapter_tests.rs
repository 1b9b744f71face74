//! Typed caches opened from settings

#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dapcache::engine::Outcome;
use dapcache::{
    AdapterError, CacheKind, CacheSet, CacheSettings, DataResult, FetchError, FetchMeta, MetadataKind,
    MetadataResponses, MetadataStore, RemoteFetcher,
};
use tempfile::TempDir;

fn settings_in(temp_dir: &TempDir) -> CacheSettings {
    let dir = temp_dir.path().to_string_lossy().to_string();
    let section = serde_json::json!({"path": dir});
    let cli = serde_json::json!({
        "function_response": section,
        "metadata_store": section,
        "stored_result": section,
        "remote_resource": section,
    });
    CacheSettings::build(None, None, Some(cli)).unwrap()
}

fn open_caches(temp_dir: &TempDir) -> CacheSet {
    CacheSet::open(&settings_in(temp_dir)).unwrap()
}

struct CountingFetcher {
    calls: AtomicUsize,
}

impl RemoteFetcher for CountingFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<FetchMeta, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.ends_with("/missing") {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            });
        }
        sink.write_all(b"<netcdf/>")?;
        Ok(FetchMeta {
            content_type: Some("Application/XML; charset=utf-8".to_string()),
            content_disposition: None,
        })
    }
}

// =============================================================================
// Cache set
// =============================================================================

#[test]
fn test_caches_share_a_directory() {
    let temp_dir = TempDir::new().unwrap();
    let caches = open_caches(&temp_dir);

    for kind in CacheKind::ALL {
        assert!(caches.engine(kind).is_some(), "{} should be available", kind);
    }
    for ledger in ["rc.cache_info", "mds.cache_info", "result_.cache_info", "rr.cache_info"] {
        assert!(temp_dir.path().join(ledger).exists(), "missing {}", ledger);
    }
}

#[test]
fn test_prefixes_keep_caches_apart() {
    let temp_dir = TempDir::new().unwrap();
    let caches = open_caches(&temp_dir);

    caches
        .function_responses()
        .get_or_compute("sst.nc", "mean(sst)", || Ok(DataResult::new("application/octet-stream", b"1".to_vec())))
        .unwrap();
    caches
        .stored_results()
        .unwrap()
        .store_result("sst.nc", "mean(sst)", || Ok(DataResult::new("application/octet-stream", b"1".to_vec())))
        .unwrap();

    let function_engine = caches.engine(CacheKind::FunctionResponse).unwrap();
    let stored_engine = caches.engine(CacheKind::StoredResult).unwrap();
    assert_eq!(function_engine.entries().unwrap().len(), 1);
    assert_eq!(stored_engine.entries().unwrap().len(), 1);
    assert!(caches
        .engine(CacheKind::MetadataStore)
        .unwrap()
        .entries()
        .unwrap()
        .is_empty());
}

// =============================================================================
// Function responses
// =============================================================================

#[test]
fn test_function_response_computed_once() {
    let temp_dir = TempDir::new().unwrap();
    let dataset = temp_dir.path().join("sst.nc");
    fs::write(&dataset, b"netcdf").unwrap();
    let dataset = dataset.to_string_lossy().to_string();

    let caches = open_caches(&temp_dir);
    let cache = caches.function_responses();
    let computed = AtomicUsize::new(0);
    let compute = || {
        computed.fetch_add(1, Ordering::SeqCst);
        Ok(DataResult::new("application/vnd.opendap.dap4.data", b"\x00\x01\x02".to_vec()))
    };

    let first = cache.get_or_compute(&dataset, "linear_scale(sst)", compute).unwrap();
    let second = cache.get_or_compute(&dataset, "linear_scale(sst)", compute).unwrap();

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(first.outcome, Some(Outcome::Created));
    assert_eq!(second.outcome, Some(Outcome::Hit));
    assert_eq!(first.result, second.result);
}

#[test]
fn test_function_response_recomputed_when_dataset_changes() {
    let temp_dir = TempDir::new().unwrap();
    let dataset = temp_dir.path().join("sst.nc");
    fs::write(&dataset, b"netcdf").unwrap();
    let name = dataset.to_string_lossy().to_string();

    let caches = open_caches(&temp_dir);
    let cache = caches.function_responses();
    cache
        .get_or_compute(&name, "f()", || Ok(DataResult::new("text/plain", b"old".to_vec())))
        .unwrap();

    let file = fs::OpenOptions::new().write(true).open(&dataset).unwrap();
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(3600))
        .unwrap();

    let response = cache
        .get_or_compute(&name, "f()", || Ok(DataResult::new("text/plain", b"new".to_vec())))
        .unwrap();
    assert_eq!(response.outcome, Some(Outcome::Created));
    assert_eq!(response.result.bytes, b"new");
}

#[test]
fn test_function_compute_error_surfaces_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let caches = open_caches(&temp_dir);

    let err = caches
        .function_responses()
        .get_or_compute("sst.nc", "bad()", || Err(AdapterError::compute("no such function: bad")))
        .unwrap_err();

    match err {
        AdapterError::Compute(message) => assert_eq!(message, "no such function: bad"),
        other => panic!("expected Compute, got {:?}", other),
    }
    assert!(caches
        .engine(CacheKind::FunctionResponse)
        .unwrap()
        .entries()
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_function_requests_compute_once() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_in(&temp_dir);
    let computed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let settings = settings.clone();
            let computed = Arc::clone(&computed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // One cache set per thread, as one per server process.
                let caches = CacheSet::open(&settings).unwrap();
                barrier.wait();
                caches
                    .function_responses()
                    .get_or_compute("sst.nc", "slow()", || {
                        computed.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(DataResult::new("text/plain", b"done".to_vec()))
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().result.bytes, b"done");
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Metadata store
// =============================================================================

#[test]
fn test_metadata_store_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_caches(&temp_dir).metadata_store().unwrap();
    let responses = MetadataResponses {
        dds: Some("Dataset { Float32 sst[time = 12]; } sst.nc;".to_string()),
        das: Some("Attributes { sst { String units \"degC\"; } }".to_string()),
        dmr: None,
    };

    assert!(store.add_responses("sst.nc", &responses).unwrap());
    assert!(!store.add_responses("sst.nc", &responses).unwrap());

    let dds = store.get_response("sst.nc", MetadataKind::Dds).unwrap().unwrap();
    assert_eq!(dds.text, responses.dds.clone().unwrap());
    assert!(store.get_response("sst.nc", MetadataKind::Dmr).unwrap().is_none());

    let mut out = Vec::new();
    assert!(store.write_response("sst.nc", MetadataKind::Das, &mut out).unwrap());
    assert_eq!(out, responses.das.clone().unwrap().into_bytes());

    assert!(store.remove_responses("sst.nc").unwrap());
    assert!(!store.remove_responses("sst.nc").unwrap());
    assert!(store.get_response("sst.nc", MetadataKind::Dds).unwrap().is_none());

    let log = fs::read_to_string(store.log_path()).unwrap();
    let ops: Vec<&str> = log.lines().map(|l| l.split(' ').nth(1).unwrap()).collect();
    assert_eq!(ops, vec!["add", "remove"]);
    assert!(store.log_path().ends_with(format!("mds{}", MetadataStore::LOG_SUFFIX)));
}

// =============================================================================
// Stored results
// =============================================================================

#[test]
fn test_stored_result_token_reloads_from_another_process() {
    let temp_dir = TempDir::new().unwrap();
    let token = open_caches(&temp_dir)
        .stored_results()
        .unwrap()
        .store_result("sst.nc", "sst[0:1:3]", || Ok(DataResult::new("application/octet-stream", vec![7u8; 32])))
        .unwrap()
        .token;

    // A later request may be served by a different process.
    let loaded = open_caches(&temp_dir)
        .stored_results()
        .unwrap()
        .load_result(&token)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.bytes, vec![7u8; 32]);
}

#[test]
fn test_stored_result_rejects_foreign_tokens() {
    let temp_dir = TempDir::new().unwrap();
    let results = open_caches(&temp_dir).stored_results().unwrap();

    for token in ["rc0123456789abcdef_0", "../result_0123456789abcdef_0", "result_.cache_info"] {
        assert!(
            matches!(results.load_result(token), Err(AdapterError::InvalidToken(_))),
            "token {} should be rejected",
            token
        );
    }
    assert!(results.load_result("result_0123456789abcdef_0").unwrap().is_none());
}

// =============================================================================
// Remote resources
// =============================================================================

#[test]
fn test_remote_resource_fetched_once() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
    });
    let cache = open_caches(&temp_dir).remote_resources(fetcher.clone()).unwrap();

    let first = cache.retrieve("https://example.org/data/sst.ncml").unwrap();
    let second = cache.retrieve("https://example.org/data/sst.ncml").unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.outcome, Outcome::Created);
    assert_eq!(second.outcome, Outcome::Hit);
    assert_eq!(second.content_type, "application/xml");
    assert_eq!(second.bytes, b"<netcdf/>");
    assert_eq!(first.fetched_at, second.fetched_at);
}

#[test]
fn test_remote_fetch_failure_not_cached() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
    });
    let caches = open_caches(&temp_dir);
    let cache = caches.remote_resources(fetcher.clone()).unwrap();

    for _ in 0..2 {
        match cache.retrieve("https://example.org/missing") {
            Err(AdapterError::Fetch(FetchError::Status { status, .. })) => assert_eq!(status, 404),
            other => panic!("expected a 404, got {:?}", other.map(|r| r.outcome)),
        }
    }

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(caches
        .engine(CacheKind::RemoteResource)
        .unwrap()
        .entries()
        .unwrap()
        .is_empty());
}
