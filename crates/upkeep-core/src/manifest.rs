use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::run::RunId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperationKind {
    Add,
    Replace,
    Delete,
}

impl FileOperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" | "a" => Some(Self::Add),
            "replace" | "r" | "m" => Some(Self::Replace),
            "delete" | "d" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn writes_content(self) -> bool {
        matches!(self, Self::Add | Self::Replace)
    }
}

/// One line of the `update.manifest` shipped inside a release package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseManifestEntry {
    pub kind: FileOperationKind,
    pub path: String,
}

pub fn parse_release_manifest(raw: &str) -> Result<Vec<ReleaseManifestEntry>> {
    let mut entries = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (raw_kind, raw_path) = trimmed.split_once(char::is_whitespace).ok_or_else(|| {
            anyhow!(
                "invalid release manifest line {}: expected '<operation> <path>'",
                line_no + 1
            )
        })?;
        let kind = FileOperationKind::parse(raw_kind).ok_or_else(|| {
            anyhow!(
                "unsupported release manifest operation '{raw_kind}' on line {}",
                line_no + 1
            )
        })?;
        let path = raw_path.trim().to_string();
        validate_relative_path(&path)
            .with_context(|| format!("invalid release manifest path on line {}", line_no + 1))?;

        entries.push(ReleaseManifestEntry { kind, path });
    }
    Ok(entries)
}

/// Rejects paths that could escape the install root.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(anyhow!("path must be relative: {path}"));
    }
    for segment in path.split(['/', '\\']) {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(anyhow!("path contains an invalid segment: {path}"));
        }
    }
    Ok(())
}

fn join_relative(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for segment in rel.split(['/', '\\']) {
        out.push(segment);
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOperation {
    pub kind: FileOperationKind,
    /// Path relative to the install root, `/`-separated.
    pub path: String,
    /// Staged copy of the new content; absent for deletes.
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
}

/// Ordered file operations for one run. Written once, before the live tree
/// is touched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    pub run_id: RunId,
    #[serde(default)]
    pub target_version: Option<Version>,
    pub operations: Vec<FileOperation>,
}

impl UpdateManifest {
    /// Builds the manifest from release entries. Adds and replaces keep their
    /// relative order and are placed ahead of deletes.
    pub fn from_entries(
        run_id: RunId,
        target_version: Option<Version>,
        entries: &[ReleaseManifestEntry],
        staged_root: &Path,
        install_root: &Path,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.path.as_str()) {
                return Err(anyhow!(
                    "release manifest lists '{}' more than once",
                    entry.path
                ));
            }
        }

        let (writes, deletes): (Vec<_>, Vec<_>) =
            entries.iter().partition(|entry| entry.kind.writes_content());

        let operations = writes
            .into_iter()
            .chain(deletes)
            .map(|entry| FileOperation {
                kind: entry.kind,
                path: entry.path.clone(),
                source: entry
                    .kind
                    .writes_content()
                    .then(|| join_relative(staged_root, &entry.path)),
                destination: join_relative(install_root, &entry.path),
            })
            .collect();

        Ok(Self {
            run_id,
            target_version,
            operations,
        })
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse update manifest")
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize update manifest")
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
