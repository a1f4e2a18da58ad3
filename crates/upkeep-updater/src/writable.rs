use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Returns the subset of `paths` the update could not write to. A path that
/// does not exist yet is judged by its nearest existing ancestor. Nothing on
/// disk is created or modified.
pub fn check_writable(paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    paths
        .iter()
        .filter(|path| !is_writable(path))
        .cloned()
        .collect()
}

fn is_writable(path: &Path) -> bool {
    let mut candidate = path;
    loop {
        match fs::metadata(candidate) {
            Ok(_) => return can_write(candidate),
            Err(err) if err.kind() == io::ErrorKind::NotFound => match candidate.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => candidate = parent,
                _ => return false,
            },
            Err(_) => return false,
        }
    }
}

// Asks the kernel, so ownership, ACLs and read-only mounts all count.
#[cfg(unix)]
fn can_write(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};

    access(path, AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn can_write(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| !metadata.permissions().readonly())
}
