use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};
use upkeep_core::{DatabaseBackupHandle, FileOperation, RunId, UpdateManifest};

use crate::database::Database;
use crate::fs_utils::{copy_file_atomic, remove_file_if_exists, write_durable};
use crate::{BackupDescriptor, BackupEntry, RunLayout};

/// Snapshots everything a run is about to change, under the run's own
/// backup directory. Every operation may be repeated for the same run.
pub struct BackupManager<'a> {
    layout: &'a RunLayout,
}

impl<'a> BackupManager<'a> {
    pub fn new(layout: &'a RunLayout) -> Self {
        Self { layout }
    }

    /// Copies each manifest destination that exists today into the backup
    /// tree. Backups already present from an earlier attempt are kept as-is.
    pub fn snapshot_files(&self, manifest: &UpdateManifest) -> Result<BackupDescriptor> {
        let run_id = &manifest.run_id;
        if let Some(existing) = self.load_descriptor(run_id)? {
            if covers_manifest(&existing, manifest) {
                debug!(run = %run_id, "file backup already complete");
                return Ok(existing);
            }
        }

        let files_dir = self.layout.backup_files_dir(run_id);
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("failed to create {}", files_dir.display()))?;

        let mut entries = Vec::with_capacity(manifest.operations.len());
        for operation in &manifest.operations {
            entries.push(self.snapshot_one(&files_dir, operation)?);
        }

        let descriptor = BackupDescriptor {
            run_id: run_id.clone(),
            entries,
        };
        let path = self.layout.backup_descriptor_path(run_id);
        let payload =
            serde_json::to_vec_pretty(&descriptor).context("failed to serialize backup descriptor")?;
        write_durable(&path, &payload)
            .with_context(|| format!("failed to write backup descriptor: {}", path.display()))?;
        info!(
            run = %run_id,
            files = descriptor.entries.iter().filter(|entry| entry.existed).count(),
            "file backup complete"
        );
        Ok(descriptor)
    }

    fn snapshot_one(&self, files_dir: &Path, operation: &FileOperation) -> Result<BackupEntry> {
        let destination = &operation.destination;
        let metadata = match fs::symlink_metadata(destination) {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", destination.display()));
            }
        };

        let Some(metadata) = metadata else {
            return Ok(BackupEntry {
                path: operation.path.clone(),
                destination: destination.clone(),
                existed: false,
                backup: None,
                created_root: outermost_missing_parent(destination, &operation.path),
            });
        };
        if !metadata.is_file() {
            return Err(anyhow!(
                "cannot back up '{}': not a regular file ({})",
                operation.path,
                destination.display()
            ));
        }

        let backup_path = files_dir.join(&operation.path);
        if !backup_path.is_file() {
            copy_file_atomic(destination, &backup_path)
                .with_context(|| format!("failed to back up '{}'", operation.path))?;
        }
        Ok(BackupEntry {
            path: operation.path.clone(),
            destination: destination.clone(),
            existed: true,
            backup: Some(backup_path),
            created_root: None,
        })
    }

    /// Dumps the database when migrations are pending and returns the
    /// handle. No pending migrations means no dump and no handle.
    pub fn snapshot_database(
        &self,
        run_id: &RunId,
        database: &dyn Database,
    ) -> Result<Option<DatabaseBackupHandle>> {
        let pending = database
            .pending_migrations()
            .context("failed to list pending migrations")?;
        let dump_path = self.layout.database_backup_path(run_id);
        if pending.is_empty() {
            remove_file_if_exists(&dump_path)
                .with_context(|| format!("failed to remove stale dump {}", dump_path.display()))?;
            info!(run = %run_id, "no pending migrations; database backup skipped");
            return Ok(None);
        }

        let handle = self.dump_database(run_id, database)?;
        info!(run = %run_id, pending = pending.len(), "database backup complete");
        Ok(Some(handle))
    }

    /// Dumps the database into the run's backup dir unconditionally. An
    /// existing dump from an earlier attempt is reused.
    pub fn dump_database(
        &self,
        run_id: &RunId,
        database: &dyn Database,
    ) -> Result<DatabaseBackupHandle> {
        let dump_path = self.layout.database_backup_path(run_id);
        if dump_path.is_file() {
            debug!(run = %run_id, "database backup already present");
            return Ok(DatabaseBackupHandle::new(dump_path));
        }

        if let Some(parent) = dump_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let part_path = dump_path.with_extension("dump.part");
        remove_file_if_exists(&part_path)
            .with_context(|| format!("failed to clear {}", part_path.display()))?;
        if let Err(err) = database.backup(&part_path) {
            let _ = remove_file_if_exists(&part_path);
            return Err(err.context("database backup failed"));
        }
        fs::rename(&part_path, &dump_path)
            .with_context(|| format!("failed to move dump into {}", dump_path.display()))?;
        Ok(DatabaseBackupHandle::new(dump_path))
    }

    pub fn load_descriptor(&self, run_id: &RunId) -> Result<Option<BackupDescriptor>> {
        let path = self.layout.backup_descriptor_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let descriptor: BackupDescriptor = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse backup descriptor: {}", path.display()))?;
        if &descriptor.run_id != run_id {
            return Err(anyhow!(
                "backup descriptor {} belongs to run {}",
                path.display(),
                descriptor.run_id
            ));
        }
        Ok(Some(descriptor))
    }
}

fn covers_manifest(descriptor: &BackupDescriptor, manifest: &UpdateManifest) -> bool {
    manifest
        .operations
        .iter()
        .all(|operation| descriptor.entry(&operation.path).is_some())
}

fn outermost_missing_parent(destination: &Path, relative: &str) -> Option<PathBuf> {
    let depth = relative.split(['/', '\\']).count().saturating_sub(1);
    let mut missing = None;
    let mut current = destination.parent();
    for _ in 0..depth {
        let Some(dir) = current else {
            break;
        };
        if dir.exists() {
            break;
        }
        missing = Some(dir.to_path_buf());
        current = dir.parent();
    }
    missing
}
