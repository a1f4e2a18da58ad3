use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use upkeep_core::RunId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    state_dir: PathBuf,
}

impl RunLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.runs_dir().join("staging")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn update_cache_path(&self) -> PathBuf {
        self.cache_dir().join("update-info.json")
    }

    pub fn installed_state_path(&self) -> PathBuf {
        self.state_dir.join("installed.json")
    }

    pub fn active_run_path(&self) -> PathBuf {
        self.runs_dir().join("active")
    }

    pub fn run_record_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn run_journal_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.journal"))
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.staging_dir().join(run_id.as_str())
    }

    pub fn download_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("download").join("release.tar.gz")
    }

    pub fn unzipped_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("unzipped")
    }

    pub fn unzipped_files_dir(&self, run_id: &RunId) -> PathBuf {
        self.unzipped_dir(run_id).join("files")
    }

    pub fn manifest_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    pub fn backup_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("backup")
    }

    pub fn backup_files_dir(&self, run_id: &RunId) -> PathBuf {
        self.backup_dir(run_id).join("files")
    }

    pub fn backup_descriptor_path(&self, run_id: &RunId) -> PathBuf {
        self.backup_dir(run_id).join("descriptor.json")
    }

    pub fn database_backup_path(&self, run_id: &RunId) -> PathBuf {
        self.backup_dir(run_id).join("database.dump")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.runs_dir(), self.staging_dir(), self.cache_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
