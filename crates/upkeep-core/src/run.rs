use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier scoping every artifact of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Mints a fresh id from wall-clock nanos, the process id and a
    /// process-local sequence number.
    pub fn generate() -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time is before unix epoch")?
            .as_nanos();
        let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Ok(Self(format!(
            "run-{nanos}-{}-{sequence}",
            std::process::id()
        )))
    }

    pub fn parse(value: &str) -> Result<Self> {
        if !is_valid_run_id(value) {
            return Err(anyhow!("invalid run id: {value}"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_run_id(value: &str) -> bool {
    value.starts_with("run-")
        && value.len() <= 128
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Release fetched from the catalog; every stage runs.
    Auto,
    /// Files were replaced out of band; only the database stages run.
    Manual,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Download,
    BackupFiles,
    UpdateFiles,
    BackupDatabase,
    UpdateDatabase,
    CleanUp,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Download => "download",
            Self::BackupFiles => "backup_files",
            Self::UpdateFiles => "update_files",
            Self::BackupDatabase => "backup_database",
            Self::UpdateDatabase => "update_database",
            Self::CleanUp => "clean_up",
        }
    }

    /// State the run is in while this stage executes.
    pub fn state(self) -> UpdateState {
        match self {
            Self::Prepare => UpdateState::Preparing,
            Self::Download => UpdateState::Downloading,
            Self::BackupFiles => UpdateState::BackingUpFiles,
            Self::UpdateFiles => UpdateState::UpdatingFiles,
            Self::BackupDatabase => UpdateState::BackingUpDatabase,
            Self::UpdateDatabase => UpdateState::UpdatingDatabase,
            Self::CleanUp => UpdateState::CleaningUp,
        }
    }

    pub fn touches_files(self) -> bool {
        matches!(self, Self::Download | Self::BackupFiles | Self::UpdateFiles)
    }

    /// The stage that must have completed before this one may start, or
    /// `None` for the entry stage. Errors for file stages of manual runs.
    pub fn predecessor(self, mode: RunMode) -> Result<Option<Stage>> {
        if mode == RunMode::Manual && self.touches_files() {
            return Err(anyhow!(
                "stage '{}' does not apply to manual updates",
                self.as_str()
            ));
        }

        Ok(match (self, mode) {
            (Self::Prepare, _) => None,
            (Self::Download, _) => Some(Self::Prepare),
            (Self::BackupFiles, _) => Some(Self::Download),
            (Self::UpdateFiles, _) => Some(Self::BackupFiles),
            (Self::BackupDatabase, RunMode::Auto) => Some(Self::UpdateFiles),
            (Self::BackupDatabase, RunMode::Manual) => Some(Self::Prepare),
            (Self::UpdateDatabase, _) => Some(Self::BackupDatabase),
            (Self::CleanUp, _) => Some(Self::UpdateDatabase),
        })
    }

    pub fn sequence(mode: RunMode) -> &'static [Stage] {
        match mode {
            RunMode::Auto => &[
                Self::Prepare,
                Self::Download,
                Self::BackupFiles,
                Self::UpdateFiles,
                Self::BackupDatabase,
                Self::UpdateDatabase,
                Self::CleanUp,
            ],
            RunMode::Manual => &[
                Self::Prepare,
                Self::BackupDatabase,
                Self::UpdateDatabase,
                Self::CleanUp,
            ],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Preparing,
    Downloading,
    BackingUpFiles,
    UpdatingFiles,
    BackingUpDatabase,
    UpdatingDatabase,
    CleaningUp,
    Done,
    RollingBack,
    RolledBack,
    /// Failed before anything in the live tree or database changed.
    Abandoned,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::BackingUpFiles => "backing_up_files",
            Self::UpdatingFiles => "updating_files",
            Self::BackingUpDatabase => "backing_up_database",
            Self::UpdatingDatabase => "updating_database",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::RolledBack | Self::Abandoned)
    }

    /// Whether rollback may be entered from this state.
    pub fn can_roll_back(self) -> bool {
        self != Self::Idle && !self.is_terminal()
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
