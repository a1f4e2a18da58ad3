use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use upkeep_catalog::{
    critical_app_update_available, critical_plugin_update_available, total_available_updates,
};
use upkeep_core::{PluginUpdateStatus, StageReport, VersionInfo};
use upkeep_updater::{DatabaseRestoreOutcome, PluginUpdateReport, RollbackReport, RunStatus};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

pub(crate) fn format_version_info_lines(info: &VersionInfo, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if info.has_errors() {
        for error in &info.errors {
            lines.push(render_status_line(style, "err", error));
        }
        return lines;
    }

    let local = format!("{} (build {})", info.local_version, info.local_build);
    if info.app_update_available() {
        let remote = match (&info.remote_version, info.remote_build) {
            (Some(version), Some(build)) => format!("{version} (build {build})"),
            (Some(version), None) => version.to_string(),
            (None, Some(build)) => format!("build {build}"),
            (None, None) => "unknown".to_string(),
        };
        let mut message = format!("app: update available {local} -> {remote}");
        if critical_app_update_available(info) {
            message.push_str(" [critical]");
        }
        if info.manual_update_required {
            message.push_str(" [manual]");
        }
        let status = if critical_app_update_available(info) {
            "warn"
        } else {
            "ok"
        };
        lines.push(render_status_line(style, status, &message));
    } else {
        lines.push(render_status_line(
            style,
            "info",
            &format!("app: up-to-date {local}"),
        ));
    }

    for plugin in &info.plugins {
        let message = match (plugin.status, &plugin.remote_version) {
            (PluginUpdateStatus::UpdateAvailable, Some(remote)) => format!(
                "plugin {}: update available {} -> {remote}",
                plugin.handle, plugin.local_version
            ),
            (PluginUpdateStatus::UpdateAvailable, None) => {
                format!("plugin {}: update available", plugin.handle)
            }
            (PluginUpdateStatus::Deleted, _) => {
                format!("plugin {}: removed from catalog", plugin.handle)
            }
            (PluginUpdateStatus::UpToDate, _) => {
                format!("plugin {}: up-to-date {}", plugin.handle, plugin.local_version)
            }
            (PluginUpdateStatus::Unknown, _) => format!("plugin {}: unknown", plugin.handle),
        };
        let status = match plugin.status {
            PluginUpdateStatus::UpdateAvailable => "ok",
            PluginUpdateStatus::Deleted => "warn",
            _ => "info",
        };
        lines.push(render_status_line(style, status, &message));
    }

    let mut summary = format!("updates available: {}", total_available_updates(info));
    if critical_plugin_update_available(info) {
        summary.push_str(" (critical plugin update)");
    }
    lines.push(summary);
    lines
}

pub(crate) fn format_stage_report_line(report: &StageReport, style: OutputStyle) -> String {
    let stage = report.stage.map_or("update", |stage| stage.as_str());
    let mut message = if report.success {
        format!("{stage}: ok")
    } else {
        let kind = report.failure_kind.map_or("unknown", |kind| kind.as_str());
        format!("{stage}: failed (kind={kind})")
    };
    if let Some(detail) = &report.message {
        message.push_str(&format!(" {detail}"));
    }
    if let Some(run_id) = &report.run_id {
        message.push_str(&format!(" (run={run_id})"));
    }
    if let Some(path) = &report.db_backup_path {
        message.push_str(&format!(" (db_backup={})", path.display()));
    }
    let status = if report.success { "ok" } else { "err" };
    render_status_line(style, status, &message)
}

pub(crate) fn format_plugin_update_lines(
    report: &PluginUpdateReport,
    style: OutputStyle,
) -> Vec<String> {
    let backup = if report.database_backed_up {
        "database backed up"
    } else {
        "no database backup"
    };
    vec![render_status_line(
        style,
        "ok",
        &format!(
            "plugin {} updated {} -> {} ({backup}, run={})",
            report.handle, report.from_version, report.to_version, report.run_id
        ),
    )]
}

pub(crate) fn format_rollback_lines(report: &RollbackReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if report.already_settled {
        lines.push(render_status_line(
            style,
            "info",
            &format!("rollback: nothing to do (run={})", report.run_id),
        ));
    }

    let (db_status, db_message) = match &report.database {
        DatabaseRestoreOutcome::NoBackup => ("info", "database: no backup".to_string()),
        DatabaseRestoreOutcome::DisabledByPolicy => {
            ("warn", "database: restore disabled by policy".to_string())
        }
        DatabaseRestoreOutcome::Restored => ("ok", "database: restored".to_string()),
        DatabaseRestoreOutcome::Failed(reason) => ("err", format!("database: failed ({reason})")),
    };
    if !report.already_settled {
        lines.push(render_status_line(style, db_status, &db_message));
        lines.push(render_status_line(
            style,
            "ok",
            &format!(
                "files: restored={} removed={} unchanged={}",
                report.files.restored.len(),
                report.files.removed.len(),
                report.files.unchanged.len()
            ),
        ));
    }
    for failure in &report.files.failures {
        lines.push(render_status_line(
            style,
            "err",
            &format!("file {}: {}", failure.path, failure.message),
        ));
    }
    for note in &report.notes {
        lines.push(render_status_line(style, "info", note));
    }
    if !report.is_complete() {
        lines.push(render_status_line(
            style,
            "err",
            "rollback incomplete; manual intervention required",
        ));
    }
    lines
}

pub(crate) fn format_run_status_lines(status: &RunStatus, style: OutputStyle) -> Vec<String> {
    let record = &status.record;
    let mut lines = vec![
        format!("run: {}", record.run_id),
        format!("mode: {}", record.mode.as_str()),
        format!("state: {}", record.state),
        format!(
            "last_completed: {}",
            record.last_completed.map_or("none", |stage| stage.as_str())
        ),
        format!("holds_lock: {}", status.holds_lock),
    ];
    if let Some(version) = &record.target_version {
        lines.push(format!(
            "target: {version} (build {})",
            record.target_build.unwrap_or(0)
        ));
    }
    if let Some(handle) = &record.db_backup {
        lines.push(format!("db_backup: {}", handle.path().display()));
    }
    if let Some(failure) = &record.failure {
        lines.push(render_status_line(
            style,
            "err",
            &format!(
                "failure: {} ({}) {}",
                failure.stage,
                failure.kind.as_str(),
                failure.message
            ),
        ));
    }
    for entry in &status.journal {
        let path = entry
            .path
            .as_deref()
            .map(|path| format!(" {path}"))
            .unwrap_or_default();
        lines.push(format!("  #{} {} {}{path}", entry.seq, entry.step, entry.state));
    }
    lines
}

/// Spinner shown while a stage runs. Plain output gets no spinner.
pub(crate) struct StageSpinner {
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl StageSpinner {
    pub(crate) fn start(style: OutputStyle, label: &str) -> Self {
        let progress_bar = (style == OutputStyle::Rich).then(|| {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(spinner) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}")
            {
                progress_bar.set_style(spinner.tick_chars("<^>v "));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            progress_bar
        });
        Self {
            progress_bar,
            started_at: Instant::now(),
        }
    }

    /// Prints `line` above the spinner so it is not overdrawn.
    pub(crate) fn println(&self, line: &str) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    pub(crate) fn finish(mut self) -> Duration {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
        self.started_at.elapsed()
    }
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}
