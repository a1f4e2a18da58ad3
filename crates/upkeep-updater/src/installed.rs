use std::collections::BTreeMap;
use std::fs;
use std::io;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use upkeep_core::{CatalogRequest, InstalledPlugin, UpdaterConfig};

use crate::fs_utils::write_durable;
use crate::RunLayout;

/// What the installation is running now. Written after the database has
/// accepted a new application or plugin version; until then the `[app]` and
/// `[[plugins]]` entries of the config describe the install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledState {
    pub version: Version,
    pub build: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub plugins: BTreeMap<String, Version>,
    pub updated_at_unix: u64,
}

impl InstalledState {
    pub fn from_config(config: &UpdaterConfig, updated_at_unix: u64) -> Self {
        Self {
            version: config.app.version.clone(),
            build: config.app.build,
            release_date: None,
            plugins: config
                .plugins
                .iter()
                .map(|plugin| (plugin.handle.clone(), plugin.version.clone()))
                .collect(),
            updated_at_unix,
        }
    }
}

pub fn read_installed_state(layout: &RunLayout) -> Result<Option<InstalledState>> {
    let path = layout.installed_state_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read installed state: {}", path.display()));
        }
    };
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing installed state: {}", path.display()))?;
    Ok(Some(state))
}

pub fn write_installed_state(layout: &RunLayout, state: &InstalledState) -> Result<()> {
    let path = layout.installed_state_path();
    let payload =
        serde_json::to_vec_pretty(state).context("failed to serialize installed state")?;
    write_durable(&path, &payload)
        .with_context(|| format!("failed to write installed state: {}", path.display()))
}

/// Catalog request describing the running install. Plugins keep the order
/// of the config; versions recorded after an update win.
pub fn catalog_request_for(
    config: &UpdaterConfig,
    installed: Option<&InstalledState>,
) -> CatalogRequest {
    let mut request = config.catalog_request();
    let Some(installed) = installed else {
        return request;
    };

    request.local_version = installed.version.clone();
    request.local_build = installed.build;
    for plugin in &mut request.plugins {
        if let Some(version) = installed.plugins.get(&plugin.handle) {
            plugin.version = version.clone();
        }
    }
    for (handle, version) in &installed.plugins {
        if !request.plugins.iter().any(|plugin| &plugin.handle == handle) {
            request.plugins.push(InstalledPlugin {
                handle: handle.clone(),
                version: version.clone(),
            });
        }
    }
    request
}
