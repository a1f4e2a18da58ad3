use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use upkeep_core::{FailureKind, RunId, UpdateState};

use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists, write_durable};
use crate::{JournalEntry, RunLayout, RunRecord};

/// Claims the single-run lock. Fails if another run holds it.
pub fn claim_active_run(layout: &RunLayout, run_id: &RunId) -> Result<PathBuf> {
    let path = layout.active_run_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_run(layout).ok().flatten();
            let detail = existing
                .map(|existing| format!(" (run={existing})"))
                .unwrap_or_default();
            return Err(anyhow!("another update run holds the lock{detail}"));
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to claim active run file: {}", path.display()));
        }
    };

    file.write_all(format!("{run_id}\n").as_bytes())
        .with_context(|| format!("failed to write active run file: {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync active run file: {}", path.display()))?;
    Ok(path)
}

pub fn read_active_run(layout: &RunLayout) -> Result<Option<RunId>> {
    let path = layout.active_run_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read active run file: {}", path.display()));
        }
    };

    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    RunId::parse(value)
        .map(Some)
        .with_context(|| format!("active run file is corrupt: {}", path.display()))
}

/// Releases the lock only if `run_id` holds it.
pub fn release_active_run(layout: &RunLayout, run_id: &RunId) -> Result<()> {
    if read_active_run(layout)?.as_ref() == Some(run_id) {
        clear_active_run(layout)?;
    }
    Ok(())
}

pub fn clear_active_run(layout: &RunLayout) -> Result<()> {
    let path = layout.active_run_path();
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to clear active run file: {}", path.display()))?;
    Ok(())
}

/// Clears a lock left behind by a finished run, or by a failed run that
/// never touched the live tree or database. Anything else is an error.
pub fn ensure_no_active_run(layout: &RunLayout) -> Result<()> {
    let active = read_active_run(layout).map_err(|err| {
        anyhow!(
            "update state requires repair (reason=active_marker_unreadable path={}): {err:#}",
            layout.active_run_path().display()
        )
    })?;
    let Some(run_id) = active else {
        return Ok(());
    };

    let Some(mut record) = read_run_record(layout, &run_id)? else {
        info!(run = %run_id, "clearing lock of unknown run");
        return clear_active_run(layout);
    };

    if record.state.is_terminal() {
        return clear_active_run(layout);
    }

    if record.failure.is_some() && !record.has_mutated() {
        info!(run = %run_id, state = %record.state, "abandoning failed run that changed nothing");
        record.state = UpdateState::Abandoned;
        record.updated_at_unix = current_unix_timestamp()?;
        write_run_record(layout, &record)?;
        let run_dir = layout.run_dir(&run_id);
        remove_dir_if_exists(&run_dir)
            .with_context(|| format!("failed to remove {}", run_dir.display()))?;
        return clear_active_run(layout);
    }

    if let Some(failure) = &record.failure {
        if failure.kind == FailureKind::Cleanup {
            return Err(anyhow!(
                "run {run_id} was applied but its clean-up failed; retry clean_up for this run (state={})",
                record.state
            ));
        }
        return Err(anyhow!(
            "run {run_id} failed after changing the installation and must be rolled back first (state={})",
            record.state
        ));
    }

    Err(anyhow!(
        "run {run_id} is still in progress (state={})",
        record.state
    ))
}

pub fn write_run_record(layout: &RunLayout, record: &RunRecord) -> Result<PathBuf> {
    let path = layout.run_record_path(&record.run_id);
    let payload = serde_json::to_vec_pretty(record).context("failed to serialize run record")?;
    write_durable(&path, &payload)
        .with_context(|| format!("failed to write run record: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_record(layout: &RunLayout, run_id: &RunId) -> Result<Option<RunRecord>> {
    let path = layout.run_record_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run record: {}", path.display()));
        }
    };

    let record = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing run record: {}", path.display()))?;
    Ok(Some(record))
}

pub fn append_journal_entry(
    layout: &RunLayout,
    run_id: &RunId,
    step: &str,
    state: &str,
    path: Option<String>,
) -> Result<JournalEntry> {
    let journal_path = layout.run_journal_path(run_id);
    if let Some(parent) = journal_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let seq = read_journal(layout, run_id)?
        .last()
        .map(|entry| entry.seq + 1)
        .unwrap_or(1);
    let entry = JournalEntry {
        seq,
        step: step.to_string(),
        state: state.to_string(),
        path,
    };
    let line = serde_json::to_string(&entry).context("failed to serialize journal entry")?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&journal_path)
        .with_context(|| format!("failed to open run journal: {}", journal_path.display()))?;
    let torn_tail = fs::read(&journal_path)
        .map(|bytes| bytes.last().is_some_and(|byte| *byte != b'\n'))
        .unwrap_or(false);
    let prefix = if torn_tail { "\n" } else { "" };
    file.write_all(format!("{prefix}{line}\n").as_bytes())
        .with_context(|| format!("failed to append run journal: {}", journal_path.display()))?;
    file.sync_data()
        .with_context(|| format!("failed to sync run journal: {}", journal_path.display()))?;
    Ok(entry)
}

pub fn read_journal(layout: &RunLayout, run_id: &RunId) -> Result<Vec<JournalEntry>> {
    let path = layout.run_journal_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading run journal: {}", path.display()));
        }
    };

    let mut entries = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Lines torn by a crash mid-append are skipped.
        match serde_json::from_str::<JournalEntry>(trimmed) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(
                "skipping unreadable journal entry {} line={}: {err}",
                path.display(),
                line_no + 1
            ),
        }
    }

    entries.sort_by_key(|entry| entry.seq);
    Ok(entries)
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
