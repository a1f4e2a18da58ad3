use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};
use upkeep_core::{DatabaseBackupHandle, FileOperation, UpdateManifest};

use crate::database::Database;
use crate::fs_utils::{copy_file_atomic, files_identical, remove_dir_if_exists, remove_file_if_exists};
use crate::{BackupDescriptor, BackupEntry, DatabaseRestoreOutcome, FileRestoreSummary, RestoreFailure};

/// Inverse of one applied file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RestoreAction {
    CopyBack { backup: PathBuf, destination: PathBuf },
    Remove {
        destination: PathBuf,
        created_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreEffect {
    Restored,
    Removed,
    Unchanged,
}

impl RestoreAction {
    fn inverse_of(operation: &FileOperation, entry: &BackupEntry) -> Result<Self> {
        if entry.destination != operation.destination {
            return Err(anyhow!(
                "backup entry destination {} does not match manifest destination {}",
                entry.destination.display(),
                operation.destination.display()
            ));
        }
        match (entry.existed, &entry.backup) {
            (true, Some(backup)) => Ok(Self::CopyBack {
                backup: backup.clone(),
                destination: entry.destination.clone(),
            }),
            (true, None) => Err(anyhow!("backup entry has no saved copy")),
            (false, _) => Ok(Self::Remove {
                destination: entry.destination.clone(),
                created_root: entry.created_root.clone(),
            }),
        }
    }

    fn apply(&self) -> Result<RestoreEffect> {
        match self {
            Self::CopyBack {
                backup,
                destination,
            } => {
                if !backup.is_file() {
                    return Err(anyhow!("saved copy is missing: {}", backup.display()));
                }
                if destination.is_file() && files_identical(backup, destination)? {
                    return Ok(RestoreEffect::Unchanged);
                }
                copy_file_atomic(backup, destination)?;
                Ok(RestoreEffect::Restored)
            }
            Self::Remove {
                destination,
                created_root,
            } => {
                let removed = remove_file_if_exists(destination)
                    .with_context(|| format!("failed to remove {}", destination.display()))?;
                if let Some(root) = created_root {
                    prune_created_dir(root)?;
                }
                Ok(if removed {
                    RestoreEffect::Removed
                } else {
                    RestoreEffect::Unchanged
                })
            }
        }
    }
}

/// A directory created by the update is removed only once nothing but
/// other directories remain in it.
fn prune_created_dir(root: &Path) -> Result<()> {
    if !root.is_dir() || contains_files(root)? {
        return Ok(());
    }
    remove_dir_if_exists(root).with_context(|| format!("failed to remove {}", root.display()))?;
    Ok(())
}

fn contains_files(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if !file_type.is_dir() || contains_files(&entry.path())? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Undoes a run from its manifest and backups. Nothing here returns an
/// error; problems land in the returned summaries.
pub struct RollbackCoordinator<'a> {
    database: &'a dyn Database,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(database: &'a dyn Database) -> Self {
        Self { database }
    }

    /// Walks the manifest backwards, restoring saved copies and removing
    /// files the update added. A failed item is recorded and skipped.
    pub fn restore_files(
        &self,
        manifest: &UpdateManifest,
        descriptor: &BackupDescriptor,
    ) -> FileRestoreSummary {
        let mut summary = FileRestoreSummary::default();
        for operation in manifest.operations.iter().rev() {
            let result = descriptor
                .entry(&operation.path)
                .ok_or_else(|| anyhow!("no backup entry recorded"))
                .and_then(|entry| RestoreAction::inverse_of(operation, entry))
                .and_then(|action| action.apply());

            match result {
                Ok(RestoreEffect::Restored) => summary.restored.push(operation.path.clone()),
                Ok(RestoreEffect::Removed) => summary.removed.push(operation.path.clone()),
                Ok(RestoreEffect::Unchanged) => summary.unchanged.push(operation.path.clone()),
                Err(err) => {
                    warn!(path = %operation.path, "failed to restore file: {err:#}");
                    summary.failures.push(RestoreFailure {
                        path: operation.path.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        info!(
            restored = summary.restored.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failures.len(),
            "file restore finished"
        );
        summary
    }

    pub fn restore_database(&self, handle: &DatabaseBackupHandle) -> DatabaseRestoreOutcome {
        let path = handle.path();
        if !path.is_file() {
            warn!(path = %path.display(), "database backup is missing");
            return DatabaseRestoreOutcome::Failed(format!(
                "database backup not found: {}",
                path.display()
            ));
        }
        match self.database.restore(path) {
            Ok(()) => {
                info!(path = %path.display(), "database restored");
                DatabaseRestoreOutcome::Restored
            }
            Err(err) => {
                warn!(path = %path.display(), "database restore failed: {err:#}");
                DatabaseRestoreOutcome::Failed(format!("{err:#}"))
            }
        }
    }
}
