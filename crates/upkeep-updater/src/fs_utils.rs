use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_else(|| "file".as_ref()));
    name.push(".upkeep-tmp");
    path.with_file_name(name)
}

/// Writes `contents` so that a reader sees either the old file or the
/// complete new one, and the new one survives a crash.
pub fn write_durable(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = sibling_tmp_path(path);
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    sync_parent_dir(path);
    Ok(())
}

/// Copies `src` over `dst` via a sibling temp file and rename.
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<()> {
    let src_metadata = fs::metadata(src)
        .with_context(|| format!("failed to stat source file: {}", src.display()))?;
    if !src_metadata.is_file() {
        return Err(anyhow!("source is not a regular file: {}", src.display()));
    }
    if fs::symlink_metadata(dst).is_ok_and(|metadata| metadata.is_dir()) {
        return Err(anyhow!(
            "destination is a directory, refusing to overwrite: {}",
            dst.display()
        ));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = sibling_tmp_path(dst);
    fs::copy(src, &tmp_path).with_context(|| {
        format!("failed to copy {} to {}", src.display(), tmp_path.display())
    })?;
    File::open(&tmp_path)
        .and_then(|file| file.sync_all())
        .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    fs::rename(&tmp_path, dst).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dst.display()
        )
    })?;
    Ok(())
}

pub fn files_identical(left: &Path, right: &Path) -> Result<bool> {
    let left_len = fs::metadata(left)
        .with_context(|| format!("failed to stat {}", left.display()))?
        .len();
    let right_len = fs::metadata(right)
        .with_context(|| format!("failed to stat {}", right.display()))?
        .len();
    if left_len != right_len {
        return Ok(false);
    }

    let mut left_file =
        File::open(left).with_context(|| format!("failed to open {}", left.display()))?;
    let mut right_file =
        File::open(right).with_context(|| format!("failed to open {}", right.display()))?;
    let mut left_buf = [0_u8; 16 * 1024];
    let mut right_buf = [0_u8; 16 * 1024];
    loop {
        let read = left_file
            .read(&mut left_buf)
            .with_context(|| format!("failed to read {}", left.display()))?;
        if read == 0 {
            return Ok(true);
        }
        right_file
            .read_exact(&mut right_buf[..read])
            .with_context(|| format!("failed to read {}", right.display()))?;
        if left_buf[..read] != right_buf[..read] {
            return Ok(false);
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
