use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;
use upkeep_core::{
    CatalogRequest, PluginUpdateInfo, ReleaseArtifact, ReleaseInfo, Requirement, VersionInfo,
};

/// Remote lookup answering "is there something newer than what is installed".
pub trait ReleaseCatalog {
    fn check(&self, request: &CatalogRequest) -> Result<VersionInfo>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppReleaseResponse {
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub build: Option<u64>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub manual_update_required: bool,
    #[serde(default)]
    pub releases: Vec<ReleaseInfo>,
    #[serde(default)]
    pub artifact: Option<ReleaseArtifact>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

/// Wire shape returned by the update-check server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogResponse {
    #[serde(default)]
    pub app: AppReleaseResponse,
    #[serde(default)]
    pub plugins: Vec<PluginUpdateInfo>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl CatalogResponse {
    pub fn into_version_info(self, request: &CatalogRequest) -> VersionInfo {
        let critical =
            self.app.critical || self.app.releases.iter().any(|release| release.critical);
        VersionInfo {
            local_version: request.local_version.clone(),
            local_build: request.local_build,
            remote_version: self.app.version,
            remote_build: self.app.build,
            critical,
            manual_update_required: self.app.manual_update_required,
            releases: self.app.releases,
            plugins: self.plugins,
            artifact: self.app.artifact,
            requirements: self.app.requirements,
            errors: self.errors,
        }
    }
}

pub struct HttpReleaseCatalog {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpReleaseCatalog {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(anyhow!("catalog url must be http(s): {url}"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("upkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build catalog http client")?;
        Ok(Self { url, client })
    }
}

impl ReleaseCatalog for HttpReleaseCatalog {
    fn check(&self, request: &CatalogRequest) -> Result<VersionInfo> {
        debug!(url = %self.url, "querying release catalog");
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .with_context(|| format!("release catalog request failed: {}", self.url))?
            .error_for_status()
            .with_context(|| format!("release catalog returned an error: {}", self.url))?;
        let body: CatalogResponse = response
            .json()
            .with_context(|| format!("failed to decode release catalog response: {}", self.url))?;
        Ok(body.into_version_info(request))
    }
}
