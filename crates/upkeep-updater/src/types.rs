use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};
use upkeep_core::{
    DatabaseBackupHandle, FailureKind, ReleaseArtifact, RunId, RunMode, Stage, StageFailure,
    UpdateState,
};

pub const RUN_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl From<&StageFailure> for RecordedFailure {
    fn from(value: &StageFailure) -> Self {
        Self {
            stage: value.stage,
            kind: value.kind,
            message: value.message.clone(),
        }
    }
}

/// Everything about a run that must survive between stage invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub version: u32,
    pub run_id: RunId,
    pub mode: RunMode,
    pub state: UpdateState,
    #[serde(default)]
    pub last_completed: Option<Stage>,
    pub started_at_unix: u64,
    pub updated_at_unix: u64,
    #[serde(default)]
    pub target_version: Option<Version>,
    #[serde(default)]
    pub target_build: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_release_date: Option<String>,
    #[serde(default)]
    pub artifact: Option<ReleaseArtifact>,
    #[serde(default)]
    pub db_backup: Option<DatabaseBackupHandle>,
    #[serde(default)]
    pub files_mutated: bool,
    #[serde(default)]
    pub database_mutated: bool,
    #[serde(default)]
    pub failure: Option<RecordedFailure>,
}

impl RunRecord {
    pub fn new(run_id: RunId, mode: RunMode, started_at_unix: u64) -> Self {
        Self {
            version: RUN_RECORD_VERSION,
            run_id,
            mode,
            state: UpdateState::Idle,
            last_completed: None,
            started_at_unix,
            updated_at_unix: started_at_unix,
            target_version: None,
            target_build: None,
            target_release_date: None,
            artifact: None,
            db_backup: None,
            files_mutated: false,
            database_mutated: false,
            failure: None,
        }
    }

    pub fn has_mutated(&self) -> bool {
        self.files_mutated || self.database_mutated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Pre-update state of one manifest path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: String,
    pub destination: PathBuf,
    pub existed: bool,
    #[serde(default)]
    pub backup: Option<PathBuf>,
    /// Outermost parent directory that did not exist before the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub run_id: RunId,
    pub entries: Vec<BackupEntry>,
}

impl BackupDescriptor {
    pub fn entry(&self, path: &str) -> Option<&BackupEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileRestoreSummary {
    pub restored: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failures: Vec<RestoreFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum DatabaseRestoreOutcome {
    NoBackup,
    DisabledByPolicy,
    Restored,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub run_id: RunId,
    pub database: DatabaseRestoreOutcome,
    pub files: FileRestoreSummary,
    /// Set when the run was already rolled back or never changed anything.
    pub already_settled: bool,
    pub notes: Vec<String>,
}

impl RollbackReport {
    pub(crate) fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            database: DatabaseRestoreOutcome::NoBackup,
            files: FileRestoreSummary::default(),
            already_settled: false,
            notes: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files.failures.is_empty()
            && !matches!(self.database, DatabaseRestoreOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginUpdateReport {
    pub run_id: RunId,
    pub handle: String,
    pub from_version: Version,
    pub to_version: Version,
    pub database_backed_up: bool,
}

/// Result of driving every stage of a run in one process.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub run_id: Option<RunId>,
    pub failure: Option<StageFailure>,
    pub rollback: Option<RollbackReport>,
}

impl UpdateOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure
            .as_ref()
            .map_or(true, |failure| failure.kind == FailureKind::Cleanup)
    }
}
