use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: Version,
    pub build: u64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PluginUpdateStatus {
    UpToDate,
    UpdateAvailable,
    Deleted,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginUpdateInfo {
    pub handle: String,
    pub local_version: Version,
    #[serde(default)]
    pub remote_version: Option<Version>,
    pub status: PluginUpdateStatus,
    #[serde(default)]
    pub releases: Vec<ReleaseInfo>,
}

/// Downloadable release package and the digests it must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseArtifact {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// A host capability the release needs, e.g. a minimum database server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub version: VersionReq,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub local_version: Version,
    pub local_build: u64,
    #[serde(default)]
    pub remote_version: Option<Version>,
    #[serde(default)]
    pub remote_build: Option<u64>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub manual_update_required: bool,
    #[serde(default)]
    pub releases: Vec<ReleaseInfo>,
    #[serde(default)]
    pub plugins: Vec<PluginUpdateInfo>,
    #[serde(default)]
    pub artifact: Option<ReleaseArtifact>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl VersionInfo {
    /// Info for a failed lookup: local fields only, plus the error.
    pub fn unavailable(local_version: Version, local_build: u64, error: impl Into<String>) -> Self {
        Self {
            local_version,
            local_build,
            remote_version: None,
            remote_build: None,
            critical: false,
            manual_update_required: false,
            releases: Vec::new(),
            plugins: Vec::new(),
            artifact: None,
            requirements: Vec::new(),
            errors: vec![error.into()],
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn app_update_available(&self) -> bool {
        if self.has_errors() {
            return false;
        }
        match (&self.remote_version, self.remote_build) {
            (Some(remote), Some(build)) => {
                (remote, build) > (&self.local_version, self.local_build)
            }
            (Some(remote), None) => remote > &self.local_version,
            (None, Some(build)) => build > self.local_build,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledPlugin {
    pub handle: String,
    pub version: Version,
}

/// Body sent to the release catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogRequest {
    pub local_version: Version,
    pub local_build: u64,
    #[serde(default)]
    pub plugins: Vec<InstalledPlugin>,
}
