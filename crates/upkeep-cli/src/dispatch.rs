use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::debug;
use upkeep_catalog::{HttpReleaseCatalog, ReleaseCatalog};
use upkeep_core::{
    CatalogRequest, DatabaseBackupHandle, Stage, StageReport, StageResult, UpdaterConfig,
    VersionInfo,
};
use upkeep_updater::{check_writable, CommandDatabase, StagedUpdateRunner};

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_elapsed, format_plugin_update_lines, format_rollback_lines,
    format_run_status_lines, format_stage_report_line, format_version_info_lines,
    render_section_header, render_status_line, OutputStyle, StageSpinner,
};
use crate::{Cli, Commands};

/// Stands in when no `catalog_url` is configured; every lookup fails.
struct UnconfiguredCatalog;

impl ReleaseCatalog for UnconfiguredCatalog {
    fn check(&self, _request: &CatalogRequest) -> Result<VersionInfo> {
        Err(anyhow!("catalog_url is not configured"))
    }
}

fn build_catalog(config: &UpdaterConfig) -> Result<Box<dyn ReleaseCatalog>> {
    match &config.catalog_url {
        Some(url) => {
            let catalog =
                HttpReleaseCatalog::new(url.clone(), Duration::from_secs(config.http_timeout_secs))
                    .context("invalid catalog_url")?;
            Ok(Box::new(catalog))
        }
        None => Ok(Box::new(UnconfiguredCatalog)),
    }
}

#[derive(Copy, Clone, Debug)]
struct Output {
    json: bool,
    style: OutputStyle,
}

impl Output {
    fn new(json: bool) -> Self {
        let style = if json {
            OutputStyle::Plain
        } else {
            current_output_style()
        };
        Self { json, style }
    }

    fn emit<T: Serialize>(self, value: &T, lines: impl FnOnce(OutputStyle) -> Vec<String>) -> Result<()> {
        if self.json {
            let rendered =
                serde_json::to_string(value).context("failed to serialize command output")?;
            println!("{rendered}");
        } else {
            for line in lines(self.style) {
                println!("{line}");
            }
        }
        Ok(())
    }

    fn spinner(self, label: &str) -> StageSpinner {
        StageSpinner::start(self.style, label)
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let output = Output::new(cli.json);
    if let Commands::Completions { shell } = cli.command {
        return write_completions_script(shell, &mut io::stdout().lock());
    }

    debug!(config = %cli.config.display(), "loading updater config");
    let config = UpdaterConfig::load(&cli.config)?;
    let catalog = build_catalog(&config)?;
    let database = CommandDatabase::new(config.database.clone());
    let mut runner = StagedUpdateRunner::new(&config, catalog.as_ref(), &database);

    match cli.command {
        Commands::Check { force } => {
            let info = runner.check_for_updates(force);
            output.emit(&info, |style| format_version_info_lines(&info, style))?;
        }
        Commands::Prepare { manual } => {
            let result = run_stage(output, Stage::Prepare, || runner.prepare(manual));
            let report = match &result {
                Ok(run_id) => StageReport::success(Stage::Prepare).with_run_id(run_id),
                Err(failure) => StageReport::failure(failure),
            };
            finish_stage(output, report, result)?;
        }
        Commands::Download { run_id } => {
            let result = run_stage(output, Stage::Download, || runner.process_download(&run_id));
            let mut report = StageReport::from_result(Stage::Download, &result).with_run_id(&run_id);
            if let Ok(manifest) = &result {
                report.message = Some(format!("staged {} file operations", manifest.operations.len()));
            }
            finish_stage(output, report, result)?;
        }
        Commands::BackupFiles { run_id } => {
            let result = run_stage(output, Stage::BackupFiles, || runner.backup_files(&run_id));
            let mut report =
                StageReport::from_result(Stage::BackupFiles, &result).with_run_id(&run_id);
            if let Ok(descriptor) = &result {
                let saved = descriptor.entries.iter().filter(|entry| entry.existed).count();
                report.message = Some(format!("saved {saved} existing files"));
            }
            finish_stage(output, report, result)?;
        }
        Commands::UpdateFiles { run_id } => {
            let result = run_stage(output, Stage::UpdateFiles, || runner.update_files(&run_id));
            let mut report =
                StageReport::from_result(Stage::UpdateFiles, &result).with_run_id(&run_id);
            if let Ok(applied) = &result {
                report.message = Some(format!("applied {applied} file operations"));
            }
            finish_stage(output, report, result)?;
        }
        Commands::BackupDb { run_id } => {
            let result =
                run_stage(output, Stage::BackupDatabase, || runner.backup_database(&run_id));
            let mut report =
                StageReport::from_result(Stage::BackupDatabase, &result).with_run_id(&run_id);
            if let Ok(handle) = &result {
                report = report.with_db_backup(handle.as_ref());
                if handle.is_none() {
                    report.message = Some("no pending migrations".to_string());
                }
            }
            finish_stage(output, report, result)?;
        }
        Commands::UpdateDb { run_id, db_backup } => {
            let handle = db_backup.map(DatabaseBackupHandle::new);
            let result = run_stage(output, Stage::UpdateDatabase, || {
                runner.update_database(&run_id, handle.as_ref())
            });
            let mut report = StageReport::from_result(Stage::UpdateDatabase, &result)
                .with_run_id(&run_id)
                .with_db_backup(handle.as_ref());
            if let Ok(applied) = &result {
                report.message = Some(format!("applied {applied} migrations"));
            }
            finish_stage(output, report, result)?;
        }
        Commands::Cleanup { run_id } => {
            let result = run_stage(output, Stage::CleanUp, || runner.clean_up(&run_id));
            let report = StageReport::from_result(Stage::CleanUp, &result).with_run_id(&run_id);
            finish_stage(output, report, result)?;
        }
        Commands::Rollback { run_id, db_backup } => {
            let handle = db_backup.map(DatabaseBackupHandle::new);
            let spinner = output.spinner("rollback");
            let report = runner.rollback_update(&run_id, handle.as_ref());
            spinner.finish();
            output.emit(&report, |style| format_rollback_lines(&report, style))?;
            if !report.is_complete() {
                return Err(anyhow!("rollback of {run_id} is incomplete"));
            }
        }
        Commands::Update { manual } => {
            if let Some(header) = render_section_header(output.style, "update") {
                println!("{header}");
            }
            let spinner = output.spinner("update");
            let outcome = runner.run_to_completion(manual, &mut |report| {
                if output.json {
                    if let Ok(rendered) = serde_json::to_string(report) {
                        println!("{rendered}");
                    }
                } else {
                    spinner.println(&format_stage_report_line(report, output.style));
                }
            });
            let elapsed = spinner.finish();

            if let Some(rollback) = &outcome.rollback {
                output.emit(rollback, |style| format_rollback_lines(rollback, style))?;
            }
            match &outcome.failure {
                None => {
                    if !output.json {
                        println!(
                            "{}",
                            render_status_line(
                                output.style,
                                "ok",
                                &format!("update complete in {}", format_elapsed(elapsed))
                            )
                        );
                    }
                }
                Some(failure) if outcome.succeeded() => {
                    if !output.json {
                        println!(
                            "{}",
                            render_status_line(
                                output.style,
                                "warn",
                                &format!("update applied; {failure}")
                            )
                        );
                    }
                }
                Some(failure) => return Err(anyhow::Error::from(failure.clone())),
            }
        }
        Commands::UpdatePlugin { handle } => {
            let spinner = output.spinner("update-plugin");
            let result = runner.update_plugin(&handle);
            spinner.finish();
            let report = result?;
            output.emit(&report, |style| format_plugin_update_lines(&report, style))?;
        }
        Commands::Status { run_id } => match runner.status(run_id.as_ref())? {
            Some(status) => {
                output.emit(&status, |style| format_run_status_lines(&status, style))?;
            }
            None => {
                if output.json {
                    println!("null");
                } else {
                    println!("no update run found");
                }
            }
        },
        Commands::CheckWritable { paths } => {
            let paths: BTreeSet<PathBuf> = if paths.is_empty() {
                config.writable_check_paths().into_iter().collect()
            } else {
                paths.into_iter().collect()
            };
            let unwritable = check_writable(&paths);
            output.emit(&unwritable, |style| {
                if unwritable.is_empty() {
                    vec![render_status_line(style, "ok", "all paths are writable")]
                } else {
                    unwritable
                        .iter()
                        .map(|path| {
                            render_status_line(
                                style,
                                "err",
                                &format!("not writable: {}", path.display()),
                            )
                        })
                        .collect()
                }
            })?;
            if !unwritable.is_empty() {
                return Err(anyhow!("{} paths are not writable", unwritable.len()));
            }
        }
        Commands::FlushCache => {
            runner.cache_mut().flush()?;
            if !output.json {
                println!(
                    "{}",
                    render_status_line(output.style, "ok", "update cache flushed")
                );
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn run_stage<T>(output: Output, stage: Stage, body: impl FnOnce() -> StageResult<T>) -> StageResult<T> {
    let spinner = output.spinner(stage.as_str());
    let result = body();
    spinner.finish();
    result
}

fn finish_stage<T>(output: Output, report: StageReport, result: StageResult<T>) -> Result<()> {
    output.emit(&report, |style| vec![format_stage_report_line(&report, style)])?;
    result.map(|_| ()).map_err(anyhow::Error::from)
}
