use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use tracing::debug;
use upkeep_core::DatabaseCommands;

/// The persistence collaborator. Only the operations the updater needs are
/// exposed; everything else about the database stays out of view.
pub trait Database {
    /// Names of migrations that would run, in order. Empty means the schema
    /// is current.
    fn pending_migrations(&self) -> Result<Vec<String>>;

    /// Writes a full dump to `destination`.
    fn backup(&self, destination: &Path) -> Result<()>;

    /// Replaces the current schema and data with the dump at `source`.
    fn restore(&self, source: &Path) -> Result<()>;

    fn run_migrations(&self) -> Result<()>;

    /// Applies the pending migrations of one plugin.
    fn run_plugin_migrations(&self, handle: &str) -> Result<()>;

    fn record_app_version(
        &self,
        _version: &Version,
        _build: u64,
        _release_date: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    fn set_maintenance_mode(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

/// Drives the database through configured external commands.
#[derive(Debug, Clone)]
pub struct CommandDatabase {
    commands: DatabaseCommands,
    timeout: Duration,
}

impl CommandDatabase {
    pub fn new(commands: DatabaseCommands) -> Self {
        let timeout = Duration::from_secs(commands.timeout_secs);
        Self { commands, timeout }
    }

    fn run(&self, name: &str, template: &[String], vars: &[(&str, String)]) -> Result<String> {
        let argv = expand_template(template, vars);
        let Some((program, args)) = argv.split_first() else {
            return Err(anyhow!("database.{name} command is not configured"));
        };
        debug!(command = name, program = %program, "running database command");

        let mut command = Command::new(program);
        command.args(args);
        run_with_timeout(&mut command, self.timeout)
            .with_context(|| format!("database {name} command failed"))
    }
}

impl Database for CommandDatabase {
    fn pending_migrations(&self) -> Result<Vec<String>> {
        if self.commands.pending.is_empty() {
            return Ok(Vec::new());
        }
        let stdout = self.run("pending", &self.commands.pending, &[])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn backup(&self, destination: &Path) -> Result<()> {
        self.run(
            "dump",
            &self.commands.dump,
            &[("path", destination.display().to_string())],
        )?;
        if !destination.is_file() {
            return Err(anyhow!(
                "database dump command did not produce {}",
                destination.display()
            ));
        }
        Ok(())
    }

    fn restore(&self, source: &Path) -> Result<()> {
        self.run(
            "restore",
            &self.commands.restore,
            &[("path", source.display().to_string())],
        )
        .map(|_| ())
    }

    fn run_migrations(&self) -> Result<()> {
        self.run("migrate", &self.commands.migrate, &[]).map(|_| ())
    }

    fn run_plugin_migrations(&self, handle: &str) -> Result<()> {
        self.run(
            "plugin_migrate",
            &self.commands.plugin_migrate,
            &[("handle", handle.to_string())],
        )
        .map(|_| ())
    }

    fn record_app_version(
        &self,
        version: &Version,
        build: u64,
        release_date: Option<&str>,
    ) -> Result<()> {
        if self.commands.record_version.is_empty() {
            return Ok(());
        }
        self.run(
            "record_version",
            &self.commands.record_version,
            &[
                ("version", version.to_string()),
                ("build", build.to_string()),
                ("date", release_date.unwrap_or_default().to_string()),
            ],
        )
        .map(|_| ())
    }

    fn set_maintenance_mode(&self, enabled: bool) -> Result<()> {
        let (name, template) = if enabled {
            ("maintenance_on", &self.commands.maintenance_on)
        } else {
            ("maintenance_off", &self.commands.maintenance_off)
        };
        if template.is_empty() {
            return Ok(());
        }
        self.run(name, template, &[]).map(|_| ())
    }
}

pub(crate) fn expand_template(template: &[String], vars: &[(&str, String)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll command")? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("command timed out after {}s", timeout.as_secs()));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Runs `command`, returning its stdout. Non-zero exit and timeouts are
/// errors carrying both output streams.
pub(crate) fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("command failed to start")?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());
    let status = wait_with_deadline(&mut child, timeout);
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    let status = status?;

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    if status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&stderr);
    Err(anyhow!(
        "status={} stdout='{}' stderr='{}'",
        status,
        stdout.trim(),
        stderr.trim()
    ))
}
