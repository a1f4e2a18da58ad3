use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::version::{CatalogRequest, InstalledPlugin};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub version: Version,
    #[serde(default)]
    pub build: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    pub handle: String,
    pub version: Version,
}

/// Argv templates for the database collaborator. `{path}`, `{version}`,
/// `{build}`, `{date}` and `{handle}` are substituted before running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseCommands {
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub dump: Vec<String>,
    #[serde(default)]
    pub restore: Vec<String>,
    #[serde(default)]
    pub migrate: Vec<String>,
    #[serde(default)]
    pub record_version: Vec<String>,
    #[serde(default)]
    pub plugin_migrate: Vec<String>,
    #[serde(default)]
    pub maintenance_on: Vec<String>,
    #[serde(default)]
    pub maintenance_off: Vec<String>,
    /// Upper bound for any single database command.
    #[serde(default = "default_db_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DatabaseCommands {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            dump: Vec::new(),
            restore: Vec::new(),
            migrate: Vec::new(),
            record_version: Vec::new(),
            plugin_migrate: Vec::new(),
            maintenance_on: Vec::new(),
            maintenance_off: Vec::new(),
            timeout_secs: default_db_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdaterConfig {
    pub install_root: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub writable_paths: Vec<PathBuf>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub backup_db_on_update: bool,
    #[serde(default = "default_true")]
    pub restore_db_on_update_failure: bool,
    #[serde(default)]
    pub release_public_key: Option<String>,
    pub app: AppConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Version>,
    #[serde(default)]
    pub database: DatabaseCommands,
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_db_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl UpdaterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse updater config")?;
        if config.install_root.as_os_str().is_empty() {
            return Err(anyhow!("install_root must not be empty"));
        }
        if config.http_timeout_secs == 0 {
            return Err(anyhow!("http_timeout_secs must be greater than zero"));
        }
        if config.database.timeout_secs == 0 {
            return Err(anyhow!("database.timeout_secs must be greater than zero"));
        }
        if let Some(key) = &config.release_public_key {
            if key.trim().len() != 64 {
                return Err(anyhow!(
                    "release_public_key must be a 32-byte hex Ed25519 key"
                ));
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read updater config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid updater config: {}", path.display()))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.install_root.join(".upkeep"))
    }

    /// Every location the update writes to. The install root and state dir
    /// always come first.
    pub fn writable_check_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.install_root.clone(), self.state_dir()];
        for path in &self.writable_paths {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    pub fn catalog_request(&self) -> CatalogRequest {
        CatalogRequest {
            local_version: self.app.version.clone(),
            local_build: self.app.build,
            plugins: self
                .plugins
                .iter()
                .map(|plugin| InstalledPlugin {
                    handle: plugin.handle.clone(),
                    version: plugin.version.clone(),
                })
                .collect(),
        }
    }
}
