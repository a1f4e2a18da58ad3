mod config;
mod manifest;
mod run;
mod stage;
mod version;

pub use config::{AppConfig, DatabaseCommands, PluginConfig, UpdaterConfig};
pub use manifest::{
    parse_release_manifest, validate_relative_path, FileOperation, FileOperationKind,
    ReleaseManifestEntry, UpdateManifest,
};
pub use run::{RunId, RunMode, Stage, UpdateState};
pub use stage::{DatabaseBackupHandle, FailureKind, StageFailure, StageReport, StageResult};
pub use version::{
    CatalogRequest, InstalledPlugin, PluginUpdateInfo, PluginUpdateStatus, ReleaseArtifact,
    ReleaseInfo, Requirement, VersionInfo,
};
