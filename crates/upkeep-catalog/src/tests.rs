use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use semver::Version;
use upkeep_core::{
    CatalogRequest, InstalledPlugin, PluginUpdateInfo, PluginUpdateStatus, ReleaseInfo,
    VersionInfo,
};

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_cache_path() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    std::env::temp_dir()
        .join(format!(
            "upkeep-catalog-tests-{}-{}-{}",
            std::process::id(),
            nanos,
            TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
        .join("cache")
        .join("update-info.json")
}

fn sample_request() -> CatalogRequest {
    CatalogRequest {
        local_version: Version::new(2, 0, 0),
        local_build: 2400,
        plugins: vec![InstalledPlugin {
            handle: "seo".to_string(),
            version: Version::new(1, 4, 0),
        }],
    }
}

fn release(version: Version, build: u64, critical: bool) -> ReleaseInfo {
    ReleaseInfo {
        version,
        build,
        critical,
        date: None,
        notes: Vec::new(),
    }
}

fn remote_info(build: u64) -> VersionInfo {
    VersionInfo {
        local_version: Version::new(2, 0, 0),
        local_build: 2400,
        remote_version: Some(Version::new(2, 1, 0)),
        remote_build: Some(build),
        critical: false,
        manual_update_required: false,
        releases: vec![release(Version::new(2, 1, 0), build, false)],
        plugins: Vec::new(),
        artifact: None,
        requirements: Vec::new(),
        errors: Vec::new(),
    }
}

struct FakeCatalog {
    calls: Cell<usize>,
    next: RefCell<Result<VersionInfo>>,
}

impl FakeCatalog {
    fn returning(info: VersionInfo) -> Self {
        Self {
            calls: Cell::new(0),
            next: RefCell::new(Ok(info)),
        }
    }

    fn failing() -> Self {
        Self {
            calls: Cell::new(0),
            next: RefCell::new(Err(anyhow!("connection refused"))),
        }
    }

    fn set_next(&self, next: Result<VersionInfo>) {
        *self.next.borrow_mut() = next;
    }
}

impl ReleaseCatalog for FakeCatalog {
    fn check(&self, _request: &CatalogRequest) -> Result<VersionInfo> {
        self.calls.set(self.calls.get() + 1);
        match &*self.next.borrow() {
            Ok(info) => Ok(info.clone()),
            Err(err) => Err(anyhow!("{err}")),
        }
    }
}

#[test]
fn cache_miss_fetches_then_serves_from_memory() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);

    let first = cache.get_cached_or_fetch_at(false, 1_000);
    let second = cache.get_cached_or_fetch_at(false, 1_030);

    assert_eq!(first, second);
    assert_eq!(catalog.calls.get(), 1);
    assert!(path.exists(), "successful lookups must be persisted");

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn force_refresh_bypasses_cache() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);

    cache.get_cached_or_fetch_at(false, 1_000);
    catalog.set_next(Ok(remote_info(2411)));
    let refreshed = cache.get_cached_or_fetch_at(true, 1_001);

    assert_eq!(catalog.calls.get(), 2);
    assert_eq!(refreshed.remote_build, Some(2411));

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn expired_entry_is_refetched() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);

    cache.get_cached_or_fetch_at(false, 1_000);
    cache.get_cached_or_fetch_at(false, 1_060);

    assert_eq!(catalog.calls.get(), 2);

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn persisted_entry_survives_a_new_cache_instance() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    {
        let mut cache =
            UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
        cache.get_cached_or_fetch_at(false, 1_000);
    }

    let mut reopened = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
    let info = reopened.cached_at(1_010).expect("must serve persisted entry");
    assert_eq!(info.remote_build, Some(2410));
    assert_eq!(catalog.calls.get(), 1);

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn fetch_failure_returns_error_list_and_is_not_persisted() {
    let catalog = FakeCatalog::failing();
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);

    let info = cache.get_cached_or_fetch_at(false, 1_000);

    assert!(info.has_errors());
    assert_eq!(info.local_version, Version::new(2, 0, 0));
    assert!(!info.app_update_available());
    assert!(!path.exists());
}

#[test]
fn failed_lookup_is_remembered_until_a_new_cache_instance() {
    let catalog = FakeCatalog::failing();
    let path = test_cache_path();
    {
        let mut cache =
            UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
        let first = cache.get_cached_or_fetch(false);
        let second = cache.get_cached_or_fetch(false);

        assert!(first.has_errors());
        assert_eq!(first, second);
        assert_eq!(catalog.calls.get(), 1);
        assert!(!cache.is_update_info_cached());
    }

    catalog.set_next(Ok(remote_info(2410)));
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
    assert!(!cache.is_update_info_cached());
    let info = cache.get_cached_or_fetch(false);

    assert!(!info.has_errors());
    assert_eq!(catalog.calls.get(), 2);
    assert!(cache.is_update_info_cached());

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn corrupt_cache_file_is_treated_as_miss() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    std::fs::create_dir_all(path.parent().expect("parent")).expect("must create cache dir");
    std::fs::write(&path, "{not json").expect("must write corrupt cache");

    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
    let info = cache.get_cached_or_fetch_at(false, 1_000);

    assert_eq!(info.remote_build, Some(2410));
    assert_eq!(catalog.calls.get(), 1);

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn flush_drops_memory_and_disk_copies() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);

    cache.get_cached_or_fetch_at(false, 1_000);
    cache.flush().expect("must flush");

    assert!(!path.exists());
    assert!(cache.cached_at(1_001).is_none());
    cache.flush().expect("flushing twice is fine");

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn cached_entry_for_other_local_version_is_ignored() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    {
        let mut cache =
            UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
        cache.get_cached_or_fetch_at(false, 1_000);
    }

    let mut upgraded_request = sample_request();
    upgraded_request.local_version = Version::new(2, 1, 0);
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), upgraded_request, &catalog);
    assert!(cache.cached_at(1_001).is_none());

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn set_request_drops_answers_for_the_previous_install() {
    let catalog = FakeCatalog::returning(remote_info(2410));
    let path = test_cache_path();
    let mut cache = UpdateCache::new(&path, Duration::from_secs(60), sample_request(), &catalog);
    cache.get_cached_or_fetch_at(false, 1_000);

    cache.set_request(sample_request());
    assert!(cache.cached_at(1_001).is_some());

    let mut upgraded_request = sample_request();
    upgraded_request.local_build = 2410;
    cache.set_request(upgraded_request.clone());
    assert_eq!(cache.request(), &upgraded_request);
    assert!(cache.cached_at(1_002).is_none());
    cache.get_cached_or_fetch_at(false, 1_003);
    assert_eq!(catalog.calls.get(), 2);

    let _ = std::fs::remove_dir_all(path.parent().and_then(|p| p.parent()).expect("root"));
}

#[test]
fn catalog_response_marks_critical_from_any_release() {
    let response = CatalogResponse {
        app: AppReleaseResponse {
            version: Some(Version::new(2, 1, 0)),
            build: Some(2410),
            releases: vec![
                release(Version::new(2, 0, 1), 2405, true),
                release(Version::new(2, 1, 0), 2410, false),
            ],
            ..AppReleaseResponse::default()
        },
        plugins: Vec::new(),
        errors: Vec::new(),
    };

    let info = response.into_version_info(&sample_request());
    assert!(info.critical);
    assert_eq!(info.local_build, 2400);
    assert!(critical_app_update_available(&info));
}

#[test]
fn catalog_response_decodes_minimal_json() {
    let response: CatalogResponse = serde_json::from_str(
        r#"{"app":{"version":"2.1.0","build":2410,"artifact":{"url":"https://example.test/r.tar.gz","sha256":"00"}}}"#,
    )
    .expect("must decode");
    let info = response.into_version_info(&sample_request());
    assert!(info.app_update_available());
    assert_eq!(
        info.artifact.map(|artifact| artifact.url),
        Some("https://example.test/r.tar.gz".to_string())
    );
}

#[test]
fn http_catalog_rejects_non_http_url() {
    assert!(HttpReleaseCatalog::new("ftp://example.test", Duration::from_secs(1)).is_err());
}

#[test]
fn total_available_updates_counts_app_and_plugins_with_releases() {
    let mut info = remote_info(2410);
    info.plugins = vec![
        PluginUpdateInfo {
            handle: "seo".to_string(),
            local_version: Version::new(1, 4, 0),
            remote_version: Some(Version::new(1, 5, 0)),
            status: PluginUpdateStatus::UpdateAvailable,
            releases: vec![release(Version::new(1, 5, 0), 1, true)],
        },
        PluginUpdateInfo {
            handle: "forms".to_string(),
            local_version: Version::new(3, 0, 0),
            remote_version: Some(Version::new(3, 1, 0)),
            status: PluginUpdateStatus::UpdateAvailable,
            releases: Vec::new(),
        },
        PluginUpdateInfo {
            handle: "maps".to_string(),
            local_version: Version::new(1, 0, 0),
            remote_version: None,
            status: PluginUpdateStatus::UpToDate,
            releases: Vec::new(),
        },
    ];

    assert_eq!(total_available_updates(&info), 2);
    assert!(critical_plugin_update_available(&info));
    assert!(!critical_app_update_available(&info));
}
