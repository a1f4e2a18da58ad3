use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::run::{RunId, Stage};

/// Location of a full database dump taken right before migrations run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseBackupHandle {
    path: PathBuf,
}

impl DatabaseBackupHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unwritable path, unmet requirement or an out-of-order stage call.
    Precondition,
    /// Catalog lookup, download or artifact verification failed.
    Fetch,
    /// The live tree or database may have been partially changed.
    Mutation,
    /// The update is applied but run artifacts could not be removed.
    Cleanup,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::Fetch => "fetch",
            Self::Mutation => "mutation",
            Self::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Flattens the whole context chain into the message.
    pub fn from_error(stage: Stage, kind: FailureKind, err: &anyhow::Error) -> Self {
        Self::new(stage, kind, format!("{err:#}"))
    }

    pub fn requires_rollback(&self) -> bool {
        self.kind == FailureKind::Mutation
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.stage,
            self.kind.as_str(),
            self.message
        )
    }
}

impl std::error::Error for StageFailure {}

pub type StageResult<T = ()> = Result<T, StageFailure>;

/// Caller-facing rendering of a stage outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_backup_path: Option<PathBuf>,
}

impl StageReport {
    pub fn success(stage: Stage) -> Self {
        Self {
            success: true,
            stage: Some(stage),
            message: None,
            failure_kind: None,
            run_id: None,
            db_backup_path: None,
        }
    }

    pub fn failure(failure: &StageFailure) -> Self {
        Self {
            success: false,
            stage: Some(failure.stage),
            message: Some(failure.message.clone()),
            failure_kind: Some(failure.kind),
            run_id: None,
            db_backup_path: None,
        }
    }

    pub fn from_result<T>(stage: Stage, result: &StageResult<T>) -> Self {
        match result {
            Ok(_) => Self::success(stage),
            Err(failure) => Self::failure(failure),
        }
    }

    pub fn with_run_id(mut self, run_id: &RunId) -> Self {
        self.run_id = Some(run_id.clone());
        self
    }

    pub fn with_db_backup(mut self, handle: Option<&DatabaseBackupHandle>) -> Self {
        self.db_backup_path = handle.map(|handle| handle.path().to_path_buf());
        self
    }
}
