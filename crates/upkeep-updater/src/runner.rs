use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::Serialize;
use tracing::{debug, info, warn};
use upkeep_catalog::{ReleaseCatalog, UpdateCache};
use upkeep_core::{
    DatabaseBackupHandle, FailureKind, FileOperationKind, PluginUpdateStatus, RunId, RunMode,
    Stage, StageFailure, StageReport, StageResult, UpdateManifest, UpdateState, UpdaterConfig,
    VersionInfo,
};

use crate::backup::BackupManager;
use crate::database::Database;
use crate::download::{fetch_artifact, load_release_entries, unpack_release, verify_artifact};
use crate::fs_utils::{copy_file_atomic, remove_dir_if_exists, remove_file_if_exists, write_durable};
use crate::installed::{
    catalog_request_for, read_installed_state, write_installed_state, InstalledState,
};
use crate::requirements::check_requirements;
use crate::rollback::RollbackCoordinator;
use crate::runs::{
    append_journal_entry, claim_active_run, current_unix_timestamp, ensure_no_active_run,
    read_active_run, read_journal, read_run_record, release_active_run, write_run_record,
};
use crate::writable::check_writable;
use crate::{
    BackupDescriptor, DatabaseRestoreOutcome, JournalEntry, PluginUpdateReport, RestoreFailure,
    RollbackReport, RunLayout, RunRecord, UpdateOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub backup_db_on_update: bool,
    pub restore_db_on_update_failure: bool,
    pub release_public_key: Option<String>,
    pub http_timeout: Duration,
}

impl UpdatePolicy {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            backup_db_on_update: config.backup_db_on_update,
            restore_db_on_update_failure: config.restore_db_on_update_failure,
            release_public_key: config.release_public_key.clone(),
            http_timeout: Duration::from_secs(config.http_timeout_secs),
        }
    }

    /// Both flags must be on for rollback to touch the database.
    pub fn restores_database(&self) -> bool {
        self.backup_db_on_update && self.restore_db_on_update_failure
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub record: RunRecord,
    pub journal: Vec<JournalEntry>,
    pub holds_lock: bool,
}

/// Failure raised inside a stage body. Without an explicit kind the stage's
/// default class applies.
struct StageError {
    kind: Option<FailureKind>,
    source: anyhow::Error,
}

impl StageError {
    fn precondition(source: anyhow::Error) -> Self {
        Self {
            kind: Some(FailureKind::Precondition),
            source,
        }
    }

    fn fetch(source: anyhow::Error) -> Self {
        Self {
            kind: Some(FailureKind::Fetch),
            source,
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(source: anyhow::Error) -> Self {
        Self { kind: None, source }
    }
}

fn default_failure_kind(stage: Stage) -> FailureKind {
    match stage {
        Stage::Prepare | Stage::BackupFiles | Stage::BackupDatabase => FailureKind::Precondition,
        Stage::Download => FailureKind::Fetch,
        Stage::UpdateFiles | Stage::UpdateDatabase => FailureKind::Mutation,
        Stage::CleanUp => FailureKind::Cleanup,
    }
}

/// Once the live tree or database has changed, any failure short of a
/// clean-up problem leaves the install half-updated.
fn effective_failure_kind(kind: FailureKind, record: &RunRecord) -> FailureKind {
    if record.has_mutated() && kind != FailureKind::Cleanup {
        FailureKind::Mutation
    } else {
        kind
    }
}

/// Drives one installation through the staged update protocol. Every stage
/// reads and writes the run record, so consecutive stages may be called from
/// separate processes.
pub struct StagedUpdateRunner<'a> {
    config: &'a UpdaterConfig,
    layout: RunLayout,
    policy: UpdatePolicy,
    cache: UpdateCache<'a>,
    database: &'a dyn Database,
}

impl<'a> StagedUpdateRunner<'a> {
    pub fn new(
        config: &'a UpdaterConfig,
        catalog: &'a dyn ReleaseCatalog,
        database: &'a dyn Database,
    ) -> Self {
        let layout = RunLayout::new(config.state_dir());
        let installed = read_installed_state(&layout).unwrap_or_else(|err| {
            warn!("ignoring unreadable installed state: {err:#}");
            None
        });
        let cache = UpdateCache::new(
            layout.update_cache_path(),
            Duration::from_secs(config.cache_ttl_secs),
            catalog_request_for(config, installed.as_ref()),
            catalog,
        );
        Self {
            config,
            layout,
            policy: UpdatePolicy::from_config(config),
            cache,
            database,
        }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn cache_mut(&mut self) -> &mut UpdateCache<'a> {
        &mut self.cache
    }

    pub fn check_for_updates(&mut self, force_refresh: bool) -> VersionInfo {
        if let Err(err) = self.sync_installed_state() {
            warn!("checking against the configured version: {err:#}");
        }
        self.cache.get_cached_or_fetch(force_refresh)
    }

    /// The version the install runs now: the last one an update recorded,
    /// or the configured one before any update finished.
    pub fn installed_state(&self) -> Result<InstalledState> {
        match read_installed_state(&self.layout)? {
            Some(installed) => Ok(installed),
            None => Ok(InstalledState::from_config(
                self.config,
                current_unix_timestamp()?,
            )),
        }
    }

    fn sync_installed_state(&mut self) -> Result<InstalledState> {
        let installed = self.installed_state()?;
        self.cache
            .set_request(catalog_request_for(self.config, Some(&installed)));
        Ok(installed)
    }

    /// Starts a new run. Catalog, requirement and writable-path checks all
    /// happen here; a failure leaves the run abandoned and the lock free.
    pub fn prepare(&mut self, manual: bool) -> StageResult<RunId> {
        let stage = Stage::Prepare;
        let precondition =
            |err: anyhow::Error| StageFailure::from_error(stage, FailureKind::Precondition, &err);

        self.layout.ensure_base_dirs().map_err(precondition)?;
        ensure_no_active_run(&self.layout).map_err(precondition)?;

        let run_id = RunId::generate().map_err(precondition)?;
        if read_run_record(&self.layout, &run_id)
            .map_err(precondition)?
            .is_some()
        {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                format!("run id {run_id} was already used"),
            ));
        }
        claim_active_run(&self.layout, &run_id).map_err(precondition)?;

        let mode = if manual { RunMode::Manual } else { RunMode::Auto };
        let started = current_unix_timestamp().map_err(precondition)?;
        let mut record = RunRecord::new(run_id.clone(), mode, started);
        record.state = UpdateState::Preparing;
        let opened = write_run_record(&self.layout, &record).and_then(|_| {
            append_journal_entry(&self.layout, &run_id, stage.as_str(), "started", None)
        });
        if let Err(err) = opened {
            if let Err(release_err) = release_active_run(&self.layout, &run_id) {
                warn!(run = %run_id, "failed to release run lock: {release_err:#}");
            }
            return Err(precondition(err));
        }
        info!(run = %run_id, mode = mode.as_str(), "update run started");

        match self.prepare_checks(&mut record) {
            Ok(()) => {
                self.finish_stage(&mut record, stage).map_err(precondition)?;
                Ok(run_id)
            }
            Err(err) => {
                let failure = StageFailure::from_error(
                    stage,
                    err.kind.unwrap_or(FailureKind::Precondition),
                    &err.source,
                );
                warn!(run = %run_id, "{failure}");
                record.failure = Some((&failure).into());
                record.state = UpdateState::Abandoned;
                if let Err(err) = self.persist(&mut record, stage.as_str(), "failed") {
                    warn!(run = %run_id, "failed to record abandoned run: {err:#}");
                }
                let run_dir = self.layout.run_dir(&run_id);
                if let Err(err) = remove_dir_if_exists(&run_dir) {
                    warn!(run = %run_id, "failed to remove {}: {err}", run_dir.display());
                }
                if let Err(err) = release_active_run(&self.layout, &run_id) {
                    warn!(run = %run_id, "failed to release run lock: {err:#}");
                }
                Err(failure)
            }
        }
    }

    fn prepare_checks(&mut self, record: &mut RunRecord) -> Result<(), StageError> {
        self.sync_installed_state().map_err(StageError::precondition)?;
        let info = match record.mode {
            RunMode::Auto => {
                let info = self.cache.get_cached_or_fetch(true);
                if info.has_errors() {
                    return Err(StageError::fetch(anyhow!(
                        "release catalog lookup failed: {}",
                        info.errors.join("; ")
                    )));
                }
                if info.manual_update_required {
                    return Err(StageError::precondition(anyhow!(
                        "release {} must be installed manually",
                        describe_remote(&info)
                    )));
                }
                if !info.app_update_available() {
                    return Err(StageError::precondition(anyhow!(
                        "already up to date (version={} build={})",
                        info.local_version,
                        info.local_build
                    )));
                }
                let artifact = info.artifact.clone().ok_or_else(|| {
                    StageError::fetch(anyhow!(
                        "catalog did not publish an artifact for release {}",
                        describe_remote(&info)
                    ))
                })?;
                record.target_version = info.remote_version.clone();
                record.target_build = info.remote_build;
                record.target_release_date = info
                    .releases
                    .iter()
                    .find(|release| info.remote_version.as_ref() == Some(&release.version))
                    .and_then(|release| release.date.clone());
                record.artifact = Some(artifact);
                Some(info)
            }
            RunMode::Manual => self.cache.cached(),
        };

        if let Some(info) = &info {
            let unmet = check_requirements(&info.requirements, &self.config.capabilities);
            if !unmet.is_empty() {
                let detail = unmet
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(StageError::precondition(anyhow!(
                    "system requirements not met: {detail}"
                )));
            }
        }

        let paths: BTreeSet<_> = self.config.writable_check_paths().into_iter().collect();
        let unwritable = check_writable(&paths);
        if !unwritable.is_empty() {
            let detail = unwritable
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StageError::precondition(anyhow!(
                "paths are not writable: {detail}"
            )));
        }
        Ok(())
    }

    /// Fetches, verifies and unpacks the release, then persists the manifest.
    pub fn process_download(&mut self, run_id: &RunId) -> StageResult<UpdateManifest> {
        self.execute_stage(run_id, Stage::Download, |runner, record| {
            let artifact = record.artifact.clone().ok_or_else(|| {
                StageError::precondition(anyhow!("run {run_id} has no release artifact recorded"))
            })?;
            let layout = &runner.layout;

            let download_path = layout.download_path(run_id);
            fetch_artifact(&artifact.url, &download_path, runner.policy.http_timeout)?;
            verify_artifact(
                &download_path,
                &artifact,
                runner.policy.release_public_key.as_deref(),
            )?;

            let unzipped = layout.unzipped_dir(run_id);
            unpack_release(&download_path, &unzipped)?;
            let entries = load_release_entries(&unzipped)?;
            let manifest = UpdateManifest::from_entries(
                run_id.clone(),
                record.target_version.clone(),
                &entries,
                &layout.unzipped_files_dir(run_id),
                &runner.config.install_root,
            )?;

            let state_dir = layout.state_dir();
            if let Some(operation) = manifest
                .operations
                .iter()
                .find(|operation| operation.destination.starts_with(state_dir))
            {
                return Err(StageError::fetch(anyhow!(
                    "release manifest targets updater state: {}",
                    operation.path
                )));
            }

            let manifest_path = layout.manifest_path(run_id);
            let payload = manifest.to_json_string()?;
            write_durable(&manifest_path, payload.as_bytes()).with_context(|| {
                format!("failed to persist update manifest: {}", manifest_path.display())
            })?;
            remove_file_if_exists(&download_path).with_context(|| {
                format!("failed to remove downloaded artifact: {}", download_path.display())
            })?;
            info!(run = %run_id, operations = manifest.operations.len(), "release staged");
            Ok(manifest)
        })
    }

    pub fn backup_files(&mut self, run_id: &RunId) -> StageResult<BackupDescriptor> {
        self.execute_stage(run_id, Stage::BackupFiles, |runner, _record| {
            let manifest = runner.load_manifest(run_id)?;
            let descriptor = BackupManager::new(&runner.layout).snapshot_files(&manifest)?;
            Ok(descriptor)
        })
    }

    /// Applies the manifest to the live tree in manifest order.
    pub fn update_files(&mut self, run_id: &RunId) -> StageResult<usize> {
        self.execute_stage(run_id, Stage::UpdateFiles, |runner, record| {
            let manifest = runner
                .load_manifest(run_id)
                .map_err(StageError::precondition)?;
            let descriptor = BackupManager::new(&runner.layout)
                .load_descriptor(run_id)
                .map_err(StageError::precondition)?
                .ok_or_else(|| {
                    StageError::precondition(anyhow!("run {run_id} has no file backup"))
                })?;
            if let Some(operation) = manifest
                .operations
                .iter()
                .find(|operation| descriptor.entry(&operation.path).is_none())
            {
                return Err(StageError::precondition(anyhow!(
                    "file backup does not cover '{}'",
                    operation.path
                )));
            }

            runner.set_maintenance_mode(true);
            record.files_mutated = true;
            runner
                .persist(record, Stage::UpdateFiles.as_str(), "mutating")
                .map_err(StageError::precondition)?;

            for operation in &manifest.operations {
                match operation.kind {
                    FileOperationKind::Add | FileOperationKind::Replace => {
                        let source = operation.source.as_ref().ok_or_else(|| {
                            anyhow!("manifest entry '{}' has no staged source", operation.path)
                        })?;
                        copy_file_atomic(source, &operation.destination)
                            .with_context(|| format!("failed to apply '{}'", operation.path))?;
                    }
                    FileOperationKind::Delete => {
                        if operation.destination.is_dir() {
                            return Err(anyhow!(
                                "refusing to delete directory '{}'",
                                operation.path
                            )
                            .into());
                        }
                        remove_file_if_exists(&operation.destination)
                            .with_context(|| format!("failed to delete '{}'", operation.path))?;
                    }
                }
                debug!(
                    path = %operation.path,
                    kind = operation.kind.as_str(),
                    "applied file operation"
                );
                append_journal_entry(
                    &runner.layout,
                    run_id,
                    operation.kind.as_str(),
                    "applied",
                    Some(operation.path.clone()),
                )?;
            }
            info!(run = %run_id, operations = manifest.operations.len(), "files updated");
            Ok(manifest.operations.len())
        })
    }

    /// Takes a dump only when migrations are pending.
    pub fn backup_database(&mut self, run_id: &RunId) -> StageResult<Option<DatabaseBackupHandle>> {
        self.execute_stage(run_id, Stage::BackupDatabase, |runner, record| {
            let handle =
                BackupManager::new(&runner.layout).snapshot_database(run_id, runner.database)?;
            record.db_backup = handle.clone();
            Ok(handle)
        })
    }

    /// Runs pending migrations and records the new application version.
    pub fn update_database(
        &mut self,
        run_id: &RunId,
        db_backup: Option<&DatabaseBackupHandle>,
    ) -> StageResult<usize> {
        self.execute_stage(run_id, Stage::UpdateDatabase, |runner, record| {
            let pending = runner
                .database
                .pending_migrations()
                .context("failed to list pending migrations")
                .map_err(StageError::precondition)?;
            let handle = db_backup.cloned().or_else(|| record.db_backup.clone());
            if !pending.is_empty() {
                match &handle {
                    None => {
                        return Err(StageError::precondition(anyhow!(
                            "{} migrations pending but no database backup was taken",
                            pending.len()
                        )));
                    }
                    Some(handle) if !handle.path().is_file() => {
                        return Err(StageError::precondition(anyhow!(
                            "database backup not found: {}",
                            handle.path().display()
                        )));
                    }
                    Some(_) => {}
                }

                runner.set_maintenance_mode(true);
                record.database_mutated = true;
                runner
                    .persist(record, Stage::UpdateDatabase.as_str(), "mutating")
                    .map_err(StageError::precondition)?;
                runner
                    .database
                    .run_migrations()
                    .context("database migration failed")?;
                info!(run = %run_id, migrations = pending.len(), "database migrated");
            }

            let installed = runner.installed_state()?;
            let (version, build, release_date) = target_version(&installed, record);
            runner
                .database
                .record_app_version(&version, build, release_date.as_deref())
                .with_context(|| format!("failed to record application version {version}"))?;
            Ok(pending.len())
        })
    }

    /// Records the new installed version, removes the run's staging and
    /// backup artifacts and closes the run.
    pub fn clean_up(&mut self, run_id: &RunId) -> StageResult<()> {
        self.execute_stage(run_id, Stage::CleanUp, |runner, record| {
            if record.target_version.is_some() {
                let mut installed = runner.installed_state()?;
                let (version, build, release_date) = target_version(&installed, record);
                installed.version = version;
                installed.build = build;
                installed.release_date = release_date;
                installed.updated_at_unix = current_unix_timestamp()?;
                write_installed_state(&runner.layout, &installed)?;
                runner
                    .cache
                    .set_request(catalog_request_for(runner.config, Some(&installed)));
                info!(
                    run = %run_id,
                    version = %installed.version,
                    build = installed.build,
                    "installed version recorded"
                );
            }
            if let Err(err) = runner.cache.flush() {
                warn!(run = %run_id, "failed to flush update cache: {err:#}");
            }
            runner.set_maintenance_mode(false);
            let run_dir = runner.layout.run_dir(run_id);
            remove_dir_if_exists(&run_dir)
                .with_context(|| format!("failed to remove {}", run_dir.display()))?;
            Ok(())
        })
    }

    /// Runs the migrations of one plugin that has a newer release in the
    /// catalog, then records its new version. The work is tracked as a
    /// manual run, so it holds the run lock and a failed migration is rolled
    /// back like any other database stage.
    pub fn update_plugin(&mut self, handle: &str) -> Result<PluginUpdateReport> {
        self.layout.ensure_base_dirs()?;
        ensure_no_active_run(&self.layout)?;
        let run_id = RunId::generate()?;
        claim_active_run(&self.layout, &run_id)?;

        let started = current_unix_timestamp()?;
        let mut record = RunRecord::new(run_id.clone(), RunMode::Manual, started);
        record.state = UpdateState::UpdatingDatabase;
        if let Err(err) = self.persist(&mut record, "plugin_update", "started") {
            if let Err(release_err) = release_active_run(&self.layout, &run_id) {
                warn!(run = %run_id, "failed to release run lock: {release_err:#}");
            }
            return Err(err);
        }
        info!(run = %run_id, plugin = handle, "plugin update started");

        let (from_version, to_version) = match self.plugin_update_target(handle) {
            Ok(target) => target,
            Err(err) => {
                self.abandon_plugin_run(&mut record, &err);
                return Err(err);
            }
        };

        let db_backup = if self.policy.backup_db_on_update {
            match BackupManager::new(&self.layout).dump_database(&run_id, self.database) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    self.abandon_plugin_run(&mut record, &err);
                    return Err(err);
                }
            }
        } else {
            None
        };

        self.set_maintenance_mode(true);
        record.db_backup = db_backup.clone();
        record.database_mutated = true;
        self.persist(&mut record, "plugin_update", "mutating")?;

        if let Err(err) = self.database.run_plugin_migrations(handle) {
            let err = err.context(format!("plugin '{handle}' migrations failed"));
            let failure =
                StageFailure::from_error(Stage::UpdateDatabase, FailureKind::Mutation, &err);
            record.failure = Some((&failure).into());
            if let Err(persist_err) = self.persist(&mut record, "plugin_update", "failed") {
                warn!(run = %run_id, "failed to record plugin update failure: {persist_err:#}");
            }
            let rollback = self.rollback_update(&run_id, db_backup.as_ref());
            let outcome = if rollback.is_complete() {
                "rolled back"
            } else {
                "rollback incomplete"
            };
            return Err(err.context(format!("run {run_id} {outcome}")));
        }

        let mut installed = self.installed_state()?;
        installed
            .plugins
            .insert(handle.to_string(), to_version.clone());
        installed.updated_at_unix = current_unix_timestamp()?;
        write_installed_state(&self.layout, &installed)?;
        self.cache
            .set_request(catalog_request_for(self.config, Some(&installed)));
        if let Err(err) = self.cache.flush() {
            warn!(run = %run_id, "failed to flush update cache: {err:#}");
        }
        self.set_maintenance_mode(false);

        record.state = UpdateState::Done;
        self.persist(&mut record, "plugin_update", "completed")?;
        let run_dir = self.layout.run_dir(&run_id);
        if let Err(err) = remove_dir_if_exists(&run_dir) {
            warn!(run = %run_id, "failed to remove {}: {err}", run_dir.display());
        }
        release_active_run(&self.layout, &run_id)?;
        info!(run = %run_id, plugin = handle, version = %to_version, "plugin updated");

        Ok(PluginUpdateReport {
            run_id,
            handle: handle.to_string(),
            from_version,
            to_version,
            database_backed_up: db_backup.is_some(),
        })
    }

    fn plugin_update_target(&mut self, handle: &str) -> Result<(Version, Version)> {
        let installed = self.sync_installed_state()?;
        let from_version = installed
            .plugins
            .get(handle)
            .cloned()
            .ok_or_else(|| anyhow!("plugin '{handle}' is not installed"))?;

        let info = self.cache.get_cached_or_fetch(false);
        if info.has_errors() {
            return Err(anyhow!(
                "release catalog lookup failed: {}",
                info.errors.join("; ")
            ));
        }
        let to_version = info
            .plugins
            .iter()
            .find(|plugin| plugin.handle == handle)
            .filter(|plugin| plugin.status == PluginUpdateStatus::UpdateAvailable)
            .and_then(|plugin| plugin.remote_version.clone())
            .filter(|remote| remote > &from_version)
            .ok_or_else(|| {
                anyhow!("plugin '{handle}' has no update available (version={from_version})")
            })?;
        Ok((from_version, to_version))
    }

    fn abandon_plugin_run(&self, record: &mut RunRecord, err: &anyhow::Error) {
        let run_id = record.run_id.clone();
        let failure =
            StageFailure::from_error(Stage::UpdateDatabase, FailureKind::Precondition, err);
        warn!(run = %run_id, "{failure}");
        record.failure = Some((&failure).into());
        record.state = UpdateState::Abandoned;
        if let Err(err) = self.persist(record, "plugin_update", "failed") {
            warn!(run = %run_id, "failed to record plugin update failure: {err:#}");
        }
        let run_dir = self.layout.run_dir(&run_id);
        if let Err(err) = remove_dir_if_exists(&run_dir) {
            warn!(run = %run_id, "failed to remove {}: {err}", run_dir.display());
        }
        if let Err(err) = release_active_run(&self.layout, &run_id) {
            warn!(run = %run_id, "failed to release run lock: {err:#}");
        }
    }

    /// Best-effort reversal of a run. Safe to repeat: a settled run is left
    /// alone and an interrupted rollback picks up where it stopped.
    pub fn rollback_update(
        &self,
        run_id: &RunId,
        db_backup: Option<&DatabaseBackupHandle>,
    ) -> RollbackReport {
        let mut report = RollbackReport::new(run_id.clone());
        let mut record = match read_run_record(&self.layout, run_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                report.already_settled = true;
                report.notes.push(format!("no record of run {run_id}"));
                return report;
            }
            Err(err) => {
                warn!(run = %run_id, "cannot read run record: {err:#}");
                report.files.failures.push(RestoreFailure {
                    path: self.layout.run_record_path(run_id).display().to_string(),
                    message: format!("{err:#}"),
                });
                return report;
            }
        };

        if !record.state.can_roll_back() {
            report.already_settled = true;
            let note = match record.state {
                UpdateState::Done => "run completed successfully; nothing to roll back".to_string(),
                state => format!("run is already {state}"),
            };
            report.notes.push(note);
            return report;
        }

        info!(run = %run_id, from = %record.state, "rolling back");
        record.state = UpdateState::RollingBack;
        if let Err(err) = self.persist(&mut record, "rollback", "started") {
            warn!(run = %run_id, "failed to record rollback start: {err:#}");
        }

        let coordinator = RollbackCoordinator::new(self.database);
        report.database = match db_backup.cloned().or_else(|| record.db_backup.clone()) {
            None => DatabaseRestoreOutcome::NoBackup,
            Some(_) if !self.policy.restores_database() => {
                info!(run = %run_id, "database restore disabled by policy");
                DatabaseRestoreOutcome::DisabledByPolicy
            }
            Some(handle) => coordinator.restore_database(&handle),
        };

        match record.mode {
            RunMode::Manual => report
                .notes
                .push("manual run has no file stages to reverse".to_string()),
            RunMode::Auto => self.rollback_files(&record, &coordinator, &mut report),
        }

        self.set_maintenance_mode(false);

        if report.is_complete() {
            record.state = UpdateState::RolledBack;
            if let Err(err) = self.persist(&mut record, "rollback", "completed") {
                warn!(run = %run_id, "failed to record rollback completion: {err:#}");
            }
            let run_dir = self.layout.run_dir(run_id);
            if let Err(err) = remove_dir_if_exists(&run_dir) {
                warn!(run = %run_id, "failed to remove {}: {err}", run_dir.display());
            }
            if let Err(err) = release_active_run(&self.layout, run_id) {
                warn!(run = %run_id, "failed to release run lock: {err:#}");
            }
            info!(run = %run_id, "rollback complete");
        } else {
            report.notes.push(
                "rollback incomplete; run artifacts kept for another attempt or manual repair"
                    .to_string(),
            );
            if let Err(err) = self.persist(&mut record, "rollback", "incomplete") {
                warn!(run = %run_id, "failed to record rollback result: {err:#}");
            }
            warn!(run = %run_id, "rollback incomplete");
        }
        report
    }

    fn rollback_files(
        &self,
        record: &RunRecord,
        coordinator: &RollbackCoordinator<'_>,
        report: &mut RollbackReport,
    ) {
        let run_id = &record.run_id;
        let manifest = match self.load_manifest(run_id) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!(run = %run_id, "update manifest unavailable: {err:#}");
                None
            }
        };
        let descriptor = match BackupManager::new(&self.layout).load_descriptor(run_id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(run = %run_id, "backup descriptor unavailable: {err:#}");
                None
            }
        };

        match (manifest, descriptor) {
            (Some(manifest), Some(descriptor)) => {
                report.files = coordinator.restore_files(&manifest, &descriptor);
            }
            _ if record.files_mutated => {
                report.files.failures.push(RestoreFailure {
                    path: self.layout.run_dir(run_id).display().to_string(),
                    message: "live files were modified but the manifest or backup is missing"
                        .to_string(),
                });
            }
            _ => report
                .notes
                .push("live files were never modified".to_string()),
        }
    }

    /// Runs every stage in order, rolling back on the first failure that
    /// is not a clean-up problem.
    pub fn run_to_completion(
        &mut self,
        manual: bool,
        observer: &mut dyn FnMut(&StageReport),
    ) -> UpdateOutcome {
        let run_id = match self.prepare(manual) {
            Ok(run_id) => {
                observer(&StageReport::success(Stage::Prepare).with_run_id(&run_id));
                run_id
            }
            Err(failure) => {
                observer(&StageReport::failure(&failure));
                return UpdateOutcome {
                    run_id: None,
                    failure: Some(failure),
                    rollback: None,
                };
            }
        };

        let mode = if manual { RunMode::Manual } else { RunMode::Auto };
        let mut db_backup: Option<DatabaseBackupHandle> = None;
        for stage in Stage::sequence(mode).iter().copied().skip(1) {
            let result = match stage {
                Stage::Prepare => Ok(()),
                Stage::Download => self.process_download(&run_id).map(|_| ()),
                Stage::BackupFiles => self.backup_files(&run_id).map(|_| ()),
                Stage::UpdateFiles => self.update_files(&run_id).map(|_| ()),
                Stage::BackupDatabase => self.backup_database(&run_id).map(|handle| {
                    db_backup = handle;
                }),
                Stage::UpdateDatabase => {
                    self.update_database(&run_id, db_backup.as_ref()).map(|_| ())
                }
                Stage::CleanUp => self.clean_up(&run_id),
            };

            let report = StageReport::from_result(stage, &result)
                .with_run_id(&run_id)
                .with_db_backup(db_backup.as_ref());
            observer(&report);

            if let Err(failure) = result {
                let rollback = (failure.kind != FailureKind::Cleanup)
                    .then(|| self.rollback_update(&run_id, db_backup.as_ref()));
                return UpdateOutcome {
                    run_id: Some(run_id),
                    failure: Some(failure),
                    rollback,
                };
            }
        }

        UpdateOutcome {
            run_id: Some(run_id),
            failure: None,
            rollback: None,
        }
    }

    /// Record and journal of `run_id`, or of the run holding the lock.
    pub fn status(&self, run_id: Option<&RunId>) -> Result<Option<RunStatus>> {
        let active = read_active_run(&self.layout)?;
        let Some(run_id) = run_id.cloned().or_else(|| active.clone()) else {
            return Ok(None);
        };
        let Some(record) = read_run_record(&self.layout, &run_id)? else {
            return Ok(None);
        };
        let journal = read_journal(&self.layout, &run_id)?;
        Ok(Some(RunStatus {
            holds_lock: active.as_ref() == Some(&run_id),
            record,
            journal,
        }))
    }

    fn execute_stage<T>(
        &mut self,
        run_id: &RunId,
        stage: Stage,
        body: impl FnOnce(&mut Self, &mut RunRecord) -> Result<T, StageError>,
    ) -> StageResult<T> {
        let mut record = self.begin_stage(run_id, stage).map_err(|err| {
            StageFailure::from_error(stage, FailureKind::Precondition, &err)
        })?;

        match body(self, &mut record) {
            Ok(value) => {
                self.finish_stage(&mut record, stage).map_err(|err| {
                    let kind = effective_failure_kind(default_failure_kind(stage), &record);
                    StageFailure::from_error(stage, kind, &err)
                })?;
                Ok(value)
            }
            Err(err) => {
                let kind = effective_failure_kind(
                    err.kind.unwrap_or_else(|| default_failure_kind(stage)),
                    &record,
                );
                let failure = StageFailure::from_error(stage, kind, &err.source);
                warn!(run = %run_id, "{failure}");
                record.failure = Some((&failure).into());
                if let Err(err) = self.persist(&mut record, stage.as_str(), "failed") {
                    warn!(run = %run_id, "failed to record stage failure: {err:#}");
                }
                Err(failure)
            }
        }
    }

    fn begin_stage(&self, run_id: &RunId, stage: Stage) -> Result<RunRecord> {
        let mut record = read_run_record(&self.layout, run_id)?
            .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
        if record.state.is_terminal() {
            return Err(anyhow!("run {run_id} is already {}", record.state));
        }
        if record.state == UpdateState::RollingBack {
            return Err(anyhow!(
                "run {run_id} is being rolled back; finish the rollback first"
            ));
        }
        if let Some(failure) = &record.failure {
            if failure.kind == FailureKind::Mutation {
                return Err(anyhow!(
                    "run {run_id} failed in {} and must be rolled back",
                    failure.stage
                ));
            }
        }

        let predecessor = stage.predecessor(record.mode)?;
        if record.last_completed == Some(stage) {
            return Err(anyhow!("stage {stage} already completed for run {run_id}"));
        }
        if record.last_completed != predecessor {
            let expected = predecessor.map_or("none", Stage::as_str);
            let actual = record.last_completed.map_or("none", Stage::as_str);
            return Err(anyhow!(
                "stage {stage} must follow {expected} (last completed: {actual})"
            ));
        }

        record.state = stage.state();
        record.failure = None;
        self.persist(&mut record, stage.as_str(), "started")?;
        Ok(record)
    }

    fn finish_stage(&self, record: &mut RunRecord, stage: Stage) -> Result<()> {
        record.last_completed = Some(stage);
        if stage == Stage::CleanUp {
            record.state = UpdateState::Done;
        }
        self.persist(record, stage.as_str(), "completed")?;
        if stage == Stage::CleanUp {
            release_active_run(&self.layout, &record.run_id)?;
            info!(run = %record.run_id, "update run complete");
        }
        Ok(())
    }

    fn persist(&self, record: &mut RunRecord, step: &str, state: &str) -> Result<()> {
        record.updated_at_unix = current_unix_timestamp()?;
        write_run_record(&self.layout, record)?;
        append_journal_entry(&self.layout, &record.run_id, step, state, None)?;
        Ok(())
    }

    fn load_manifest(&self, run_id: &RunId) -> Result<UpdateManifest> {
        let path = self.layout.manifest_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow!("run {run_id} has no update manifest"));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let manifest = UpdateManifest::from_json_str(&raw)?;
        if &manifest.run_id != run_id {
            return Err(anyhow!(
                "update manifest {} belongs to run {}",
                path.display(),
                manifest.run_id
            ));
        }
        Ok(manifest)
    }

    fn set_maintenance_mode(&self, enabled: bool) {
        if let Err(err) = self.database.set_maintenance_mode(enabled) {
            warn!(enabled, "failed to toggle maintenance mode: {err:#}");
        }
    }
}

fn describe_remote(info: &VersionInfo) -> String {
    match (&info.remote_version, info.remote_build) {
        (Some(version), Some(build)) => format!("{version} (build {build})"),
        (Some(version), None) => version.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Version a run installs. Manual runs carry no target and keep the
/// installed one.
fn target_version(
    installed: &InstalledState,
    record: &RunRecord,
) -> (Version, u64, Option<String>) {
    match &record.target_version {
        Some(version) => (
            version.clone(),
            record.target_build.unwrap_or(0),
            record.target_release_date.clone(),
        ),
        None => (
            installed.version.clone(),
            installed.build,
            installed.release_date.clone(),
        ),
    }
}
