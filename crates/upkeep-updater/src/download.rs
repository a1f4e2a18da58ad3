use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, info};
use upkeep_core::{parse_release_manifest, ReleaseArtifact, ReleaseManifestEntry};
use upkeep_security::{sha256_hex_file, verify_release_signature, verify_sha256_file};

use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};

const RELEASE_MANIFEST_NAME: &str = "update.manifest";
const RELEASE_FILES_DIR: &str = "files";

enum ArtifactSource {
    Http(String),
    Local(PathBuf),
}

fn classify_source(url: &str) -> Result<ArtifactSource> {
    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(ArtifactSource::Http(url.to_string()));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(ArtifactSource::Local(PathBuf::from(path)));
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported artifact url scheme: {url}"));
    }
    Ok(ArtifactSource::Local(PathBuf::from(url)))
}

/// Fetches the release artifact into `destination` through a `.part` file.
pub fn fetch_artifact(url: &str, destination: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create download dir: {}", parent.display()))?;
    }

    let part_path = destination.with_extension("gz.part");
    let result = match classify_source(url)? {
        ArtifactSource::Http(url) => download_http(&url, &part_path, timeout),
        ArtifactSource::Local(path) => copy_local(&path, &part_path, timeout)
            .with_context(|| format!("failed to copy local artifact: {}", path.display())),
    };

    if let Err(err) = result {
        let _ = remove_file_if_exists(&part_path);
        return Err(err);
    }

    fs::rename(&part_path, destination).with_context(|| {
        format!(
            "failed to move downloaded artifact into place: {}",
            destination.display()
        )
    })?;
    Ok(())
}

fn copy_local(source: &Path, out_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut reader = File::open(source)
        .with_context(|| format!("failed to open {}", source.display()))?;
    let mut file = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut buffer = [0_u8; 64 * 1024];
    let mut written = 0_u64;
    loop {
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "copy timed out after {}s ({written} bytes copied)",
                timeout.as_secs()
            ));
        }
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", source.display()))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        written += read as u64;
    }
    file.sync_all()
        .with_context(|| format!("failed to sync {}", out_path.display()))?;
    debug!(bytes = written, "local artifact copied");
    Ok(())
}

fn download_http(url: &str, out_path: &Path, timeout: Duration) -> Result<()> {
    info!(%url, "downloading release artifact");
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("failed to build download http client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("artifact download failed: {url}"))?
        .error_for_status()
        .with_context(|| format!("artifact download returned an error: {url}"))?;

    let mut file = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let written = io::copy(&mut response, &mut file)
        .with_context(|| format!("failed while streaming artifact: {url}"))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", out_path.display()))?;
    debug!(bytes = written, "artifact download complete");
    Ok(())
}

/// Checks the artifact against its published digest, size and, when a
/// release key is configured, its signature. Nothing is unpacked before this
/// passes.
pub fn verify_artifact(
    path: &Path,
    artifact: &ReleaseArtifact,
    public_key_hex: Option<&str>,
) -> Result<()> {
    if artifact.sha256.trim().is_empty() {
        return Err(anyhow!("release artifact has no published sha256 digest"));
    }

    if let Some(expected_size) = artifact.size {
        let actual_size = fs::metadata(path)
            .with_context(|| format!("failed to stat artifact: {}", path.display()))?
            .len();
        if actual_size != expected_size {
            return Err(anyhow!(
                "artifact size mismatch: expected {expected_size} bytes, got {actual_size}"
            ));
        }
    }

    if !verify_sha256_file(path, &artifact.sha256)? {
        let actual = sha256_hex_file(path)?;
        return Err(anyhow!(
            "artifact sha256 mismatch: expected {}, got {actual}",
            artifact.sha256.trim()
        ));
    }

    if let Some(public_key_hex) = public_key_hex {
        let signature = artifact
            .signature
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("release key is configured but the artifact carries no signature")
            })?;
        verify_release_signature(path, public_key_hex, signature)?;
    }

    Ok(())
}

/// Unpacks a gzip tarball into a fresh `destination`. Only regular files and
/// directories are accepted, and entries that would land outside
/// `destination` are rejected.
pub fn unpack_release(archive_path: &Path, destination: &Path) -> Result<()> {
    remove_dir_if_exists(destination)
        .with_context(|| format!("failed to clear {}", destination.display()))?;
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;

    let file = File::open(archive_path)
        .with_context(|| format!("failed to open artifact: {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = archive
        .entries()
        .with_context(|| format!("failed to read archive: {}", archive_path.display()))?;
    for entry in entries {
        let mut entry =
            entry.with_context(|| format!("corrupt archive: {}", archive_path.display()))?;
        let entry_path = entry
            .path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| "<non-utf8>".to_string());
        let entry_type = entry.header().entry_type();
        if entry_type.is_pax_global_extensions() {
            continue;
        }
        if !entry_type.is_file() && !entry_type.is_dir() {
            return Err(anyhow!(
                "archive entry is not a regular file or directory: {entry_path}"
            ));
        }
        let unpacked = entry
            .unpack_in(destination)
            .with_context(|| format!("failed to unpack archive entry '{entry_path}'"))?;
        if !unpacked {
            return Err(anyhow!(
                "archive entry escapes the staging directory: {entry_path}"
            ));
        }
    }
    Ok(())
}

/// Reads `update.manifest` from an unpacked release and checks that every
/// add/replace has its payload under `files/`.
pub fn load_release_entries(unzipped_dir: &Path) -> Result<Vec<ReleaseManifestEntry>> {
    let manifest_path = unzipped_dir.join(RELEASE_MANIFEST_NAME);
    let raw = fs::read_to_string(&manifest_path).with_context(|| {
        format!(
            "release package has no readable {RELEASE_MANIFEST_NAME}: {}",
            manifest_path.display()
        )
    })?;
    let entries = parse_release_manifest(&raw)
        .with_context(|| format!("invalid release manifest: {}", manifest_path.display()))?;

    let files_dir = unzipped_dir.join(RELEASE_FILES_DIR);
    for entry in entries.iter().filter(|entry| entry.kind.writes_content()) {
        if has_symlink_component(&files_dir, &entry.path) {
            return Err(anyhow!(
                "release payload for '{}' passes through a symlink",
                entry.path
            ));
        }
        let payload = files_dir.join(&entry.path);
        let is_file = fs::symlink_metadata(&payload).is_ok_and(|metadata| metadata.is_file());
        if !is_file {
            return Err(anyhow!(
                "release package is missing payload for '{}' ({})",
                entry.path,
                payload.display()
            ));
        }
    }
    Ok(entries)
}

fn has_symlink_component(root: &Path, rel: &str) -> bool {
    let is_symlink = |path: &Path| {
        fs::symlink_metadata(path).is_ok_and(|metadata| metadata.file_type().is_symlink())
    };
    if is_symlink(root) {
        return true;
    }
    let mut current = root.to_path_buf();
    Path::new(rel).components().any(|component| {
        current.push(component);
        is_symlink(&current)
    })
}
