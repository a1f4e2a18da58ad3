use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use semver::Version;
use upkeep_core::{
    FailureKind, PluginUpdateInfo, PluginUpdateStatus, ReleaseInfo, RunId, Stage, StageFailure,
    StageReport, VersionInfo,
};
use upkeep_updater::{DatabaseRestoreOutcome, PluginUpdateReport, RestoreFailure, RollbackReport};

use super::*;
use crate::logging::default_level;
use crate::render::{
    format_plugin_update_lines, format_rollback_lines, format_stage_report_line,
    format_version_info_lines, render_status_line, OutputStyle,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "upkeep-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).expect("must create test dir");
    dir
}

fn write_config(dir: &std::path::Path) -> PathBuf {
    let site = dir.join("site");
    fs::create_dir_all(&site).expect("must create site");
    let path = dir.join("upkeep.toml");
    fs::write(
        &path,
        format!(
            "install_root = \"{}\"\nstate_dir = \"{}\"\n\n[app]\nversion = \"1.0.0\"\nbuild = 100\n",
            site.display(),
            dir.join("state").display()
        ),
    )
    .expect("must write config");
    path
}

fn sample_run_id() -> RunId {
    RunId::parse("run-1771001234-42-0").expect("valid run id")
}

#[test]
fn cli_parses_stage_commands_with_run_ids() {
    let cli = Cli::try_parse_from([
        "upkeep",
        "update-db",
        "run-1771001234-42-0",
        "--db-backup",
        "/var/backups/db.dump",
    ])
    .expect("command must parse");
    match cli.command {
        Commands::UpdateDb { run_id, db_backup } => {
            assert_eq!(run_id, sample_run_id());
            assert_eq!(db_backup, Some(PathBuf::from("/var/backups/db.dump")));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_plugin_update_handle() {
    let cli = Cli::try_parse_from(["upkeep", "update-plugin", "seo"]).expect("command must parse");
    match cli.command {
        Commands::UpdatePlugin { handle } => assert_eq!(handle, "seo"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn plugin_update_line_names_versions_and_run() {
    let report = PluginUpdateReport {
        run_id: sample_run_id(),
        handle: "seo".to_string(),
        from_version: Version::new(1, 4, 0),
        to_version: Version::new(1, 5, 0),
        database_backed_up: true,
    };
    assert_eq!(
        format_plugin_update_lines(&report, OutputStyle::Plain),
        vec![
            "plugin seo updated 1.4.0 -> 1.5.0 (database backed up, run=run-1771001234-42-0)"
                .to_string()
        ]
    );
}

#[test]
fn cli_rejects_malformed_run_ids() {
    let err = Cli::try_parse_from(["upkeep", "rollback", "../../etc"])
        .expect_err("path-like run id must be rejected");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
}

#[test]
fn cli_global_flags_apply_after_subcommand() {
    let cli = Cli::try_parse_from([
        "upkeep",
        "check",
        "--force",
        "-vv",
        "--json",
        "--config",
        "/etc/upkeep.toml",
    ])
    .expect("command must parse");
    assert_eq!(cli.verbose, 2);
    assert!(cli.json);
    assert_eq!(cli.config, PathBuf::from("/etc/upkeep.toml"));
    assert!(matches!(cli.command, Commands::Check { force: true }));
}

#[test]
fn verbosity_maps_to_default_log_level() {
    assert_eq!(default_level(0), "warn");
    assert_eq!(default_level(1), "info");
    assert_eq!(default_level(2), "debug");
    assert_eq!(default_level(7), "trace");
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "update cache flushed"),
        "update cache flushed"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "update cache flushed"),
        "[OK] update cache flushed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "not writable: /srv/site"),
        "[ERR] not writable: /srv/site"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "info", "database: no backup"),
        "[..] database: no backup"
    );
}

#[test]
fn stage_report_line_includes_failure_kind_and_run() {
    let failure = StageFailure::new(Stage::UpdateFiles, FailureKind::Mutation, "disk full");
    let report = StageReport::failure(&failure).with_run_id(&sample_run_id());
    assert_eq!(
        format_stage_report_line(&report, OutputStyle::Rich),
        "[ERR] update_files: failed (kind=mutation) disk full (run=run-1771001234-42-0)"
    );

    let ok = StageReport::success(Stage::Prepare).with_run_id(&sample_run_id());
    assert_eq!(
        format_stage_report_line(&ok, OutputStyle::Plain),
        "prepare: ok (run=run-1771001234-42-0)"
    );
}

#[test]
fn version_info_lines_flag_critical_updates() {
    let info = VersionInfo {
        local_version: Version::new(1, 0, 0),
        local_build: 100,
        remote_version: Some(Version::new(1, 1, 0)),
        remote_build: Some(110),
        critical: false,
        manual_update_required: false,
        releases: vec![ReleaseInfo {
            version: Version::new(1, 1, 0),
            build: 110,
            critical: true,
            date: None,
            notes: Vec::new(),
        }],
        plugins: vec![PluginUpdateInfo {
            handle: "seo".to_string(),
            local_version: Version::new(2, 0, 0),
            remote_version: Some(Version::new(2, 1, 0)),
            status: PluginUpdateStatus::UpdateAvailable,
            releases: vec![ReleaseInfo {
                version: Version::new(2, 1, 0),
                build: 1,
                critical: false,
                date: None,
                notes: Vec::new(),
            }],
        }],
        artifact: None,
        requirements: Vec::new(),
        errors: Vec::new(),
    };

    let lines = format_version_info_lines(&info, OutputStyle::Rich);
    assert_eq!(
        lines,
        vec![
            "[WARN] app: update available 1.0.0 (build 100) -> 1.1.0 (build 110) [critical]"
                .to_string(),
            "[OK] plugin seo: update available 2.0.0 -> 2.1.0".to_string(),
            "updates available: 2".to_string(),
        ]
    );

    let unavailable = VersionInfo::unavailable(Version::new(1, 0, 0), 100, "catalog offline");
    assert_eq!(
        format_version_info_lines(&unavailable, OutputStyle::Plain),
        vec!["catalog offline".to_string()]
    );
}

#[test]
fn rollback_lines_report_incomplete_restores() {
    let mut report = sample_rollback_report();
    report.files.failures.push(RestoreFailure {
        path: "index.php".to_string(),
        message: "permission denied".to_string(),
    });

    let lines = format_rollback_lines(&report, OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "database: restored".to_string(),
            "files: restored=2 removed=1 unchanged=0".to_string(),
            "file index.php: permission denied".to_string(),
            "rollback incomplete; manual intervention required".to_string(),
        ]
    );
}

fn sample_rollback_report() -> RollbackReport {
    let mut report = RollbackReport {
        run_id: sample_run_id(),
        database: DatabaseRestoreOutcome::Restored,
        files: Default::default(),
        already_settled: false,
        notes: Vec::new(),
    };
    report.files.restored = vec!["a.txt".to_string(), "b.txt".to_string()];
    report.files.removed = vec!["c.txt".to_string()];
    report
}

#[test]
fn completions_script_names_the_binary() {
    let mut script = Vec::new();
    completion::write_completions_script(clap_complete::Shell::Bash, &mut script)
        .expect("must write completions");
    let script = String::from_utf8(script).expect("utf8 script");
    assert!(script.contains("upkeep"));
    assert!(script.contains("rollback"));
}

#[test]
fn check_writable_command_passes_for_writable_install() {
    let dir = test_dir();
    let config = write_config(&dir);
    let cli = Cli::try_parse_from([
        "upkeep".to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "check-writable".to_string(),
    ])
    .expect("command must parse");
    dispatch::run_cli(cli).expect("writable install must pass");
}

#[test]
fn manual_update_runs_database_stages_end_to_end() {
    let dir = test_dir();
    let config = write_config(&dir);
    let cli = Cli::try_parse_from([
        "upkeep".to_string(),
        "--json".to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "update".to_string(),
        "--manual".to_string(),
    ])
    .expect("command must parse");
    dispatch::run_cli(cli).expect("manual update must succeed");

    assert!(!dir.join("state").join("runs").join("active").exists());
}
