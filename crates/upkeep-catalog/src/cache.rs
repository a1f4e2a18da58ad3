use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use upkeep_core::{CatalogRequest, VersionInfo};

use crate::catalog::ReleaseCatalog;

const FETCH_ERROR_MESSAGE: &str =
    "An error occurred when trying to determine if an update is available. Please try again shortly.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedVersionInfo {
    fetched_at_unix: u64,
    expires_at_unix: u64,
    info: VersionInfo,
}

/// Memoizes the last catalog answer in memory and on disk for a bounded
/// window.
pub struct UpdateCache<'a> {
    cache_path: PathBuf,
    ttl: Duration,
    request: CatalogRequest,
    catalog: &'a dyn ReleaseCatalog,
    memo: Option<CachedVersionInfo>,
}

impl<'a> UpdateCache<'a> {
    pub fn new(
        cache_path: impl Into<PathBuf>,
        ttl: Duration,
        request: CatalogRequest,
        catalog: &'a dyn ReleaseCatalog,
    ) -> Self {
        Self {
            cache_path: cache_path.into(),
            ttl,
            request,
            catalog,
            memo: None,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn request(&self) -> &CatalogRequest {
        &self.request
    }

    /// Points the cache at a changed install. Answers computed for the old
    /// request are dropped from memory; the file copy no longer matches the
    /// local version and is ignored on read.
    pub fn set_request(&mut self, request: CatalogRequest) {
        if request != self.request {
            self.memo = None;
            self.request = request;
        }
    }

    /// Never fails: a lookup error comes back as `VersionInfo::errors`.
    pub fn get_cached_or_fetch(&mut self, force_refresh: bool) -> VersionInfo {
        match now_unix() {
            Ok(now) => self.get_cached_or_fetch_at(force_refresh, now),
            Err(err) => {
                warn!("update cache clock unavailable: {err:#}");
                self.fetch(u64::MAX)
            }
        }
    }

    pub(crate) fn get_cached_or_fetch_at(&mut self, force_refresh: bool, now: u64) -> VersionInfo {
        if !force_refresh {
            if let Some(info) = self.cached_at(now) {
                return info;
            }
        }
        self.fetch(now)
    }

    /// Cached info without touching the network.
    pub fn cached(&mut self) -> Option<VersionInfo> {
        self.cached_at(now_unix().ok()?)
    }

    pub(crate) fn cached_at(&mut self, now: u64) -> Option<VersionInfo> {
        if let Some(memo) = &self.memo {
            if memo.expires_at_unix > now {
                return Some(memo.info.clone());
            }
            self.memo = None;
        }

        let entry = match self.read_entry() {
            Ok(entry) => entry?,
            Err(err) => {
                warn!("ignoring unreadable update cache: {err:#}");
                return None;
            }
        };
        if entry.expires_at_unix <= now
            || entry.info.local_version != self.request.local_version
            || entry.info.local_build != self.request.local_build
        {
            return None;
        }
        let info = entry.info.clone();
        self.memo = Some(entry);
        Some(info)
    }

    /// True when a successful lookup is cached. A remembered failure does
    /// not count.
    pub fn is_update_info_cached(&mut self) -> bool {
        self.cached().is_some_and(|info| !info.has_errors())
    }

    /// Drops both the in-memory and the on-disk copy.
    pub fn flush(&mut self) -> Result<()> {
        info!("flushing update info from cache");
        self.memo = None;
        match fs::remove_file(&self.cache_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "failed to remove update cache: {}",
                    self.cache_path.display()
                )
            }),
        }
    }

    fn fetch(&mut self, now: u64) -> VersionInfo {
        let info = match self.catalog.check(&self.request) {
            Ok(info) => info,
            Err(err) => {
                warn!("release catalog lookup failed: {err:#}");
                VersionInfo::unavailable(
                    self.request.local_version.clone(),
                    self.request.local_build,
                    FETCH_ERROR_MESSAGE,
                )
            }
        };

        let entry = CachedVersionInfo {
            fetched_at_unix: now,
            expires_at_unix: now.saturating_add(self.ttl.as_secs()),
            info: info.clone(),
        };
        if !info.has_errors() {
            if let Err(err) = self.write_entry(&entry) {
                warn!("failed to persist update cache: {err:#}");
            }
        }
        self.memo = Some(entry);
        info
    }

    fn read_entry(&self) -> Result<Option<CachedVersionInfo>> {
        let raw = match fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read update cache: {}", self.cache_path.display())
                })
            }
        };
        let entry = serde_json::from_str(&raw).with_context(|| {
            format!("failed to parse update cache: {}", self.cache_path.display())
        })?;
        Ok(Some(entry))
    }

    fn write_entry(&self, entry: &CachedVersionInfo) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_vec_pretty(entry).context("failed to serialize update cache")?;
        let tmp_path = self.cache_path.with_extension("json.part");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.cache_path).with_context(|| {
            format!(
                "failed to move update cache into place: {}",
                self.cache_path.display()
            )
        })
    }
}

fn now_unix() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
