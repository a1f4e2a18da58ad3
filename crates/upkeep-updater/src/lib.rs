mod backup;
mod database;
mod download;
mod fs_utils;
mod installed;
mod layout;
mod requirements;
mod rollback;
mod runner;
mod runs;
mod types;
mod writable;

pub use backup::BackupManager;
pub use database::{CommandDatabase, Database};
pub use download::{fetch_artifact, load_release_entries, unpack_release, verify_artifact};
pub use installed::{
    catalog_request_for, read_installed_state, write_installed_state, InstalledState,
};
pub use layout::RunLayout;
pub use requirements::{check_requirements, UnmetRequirement};
pub use rollback::RollbackCoordinator;
pub use runner::{RunStatus, StagedUpdateRunner, UpdatePolicy};
pub use runs::{
    append_journal_entry, claim_active_run, clear_active_run, current_unix_timestamp,
    ensure_no_active_run, read_active_run, read_journal, read_run_record, release_active_run,
    write_run_record,
};
pub use types::{
    BackupDescriptor, BackupEntry, DatabaseRestoreOutcome, FileRestoreSummary, JournalEntry,
    PluginUpdateReport, RecordedFailure, RestoreFailure, RollbackReport, RunRecord,
    UpdateOutcome, RUN_RECORD_VERSION,
};
pub use writable::check_writable;
