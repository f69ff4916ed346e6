use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

/// Missing paths count as already removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    ignore_missing(fs::remove_file(path))
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    ignore_missing(fs::remove_dir_all(path))
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// True when `path` is a directory with at least one entry.
pub fn dir_is_populated(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Moves a staged payload into place, falling back to a copy when the
/// staging area sits on another filesystem.
pub(crate) fn relocate_dir(staged: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if fs::rename(staged, target).is_ok() {
        return Ok(());
    }

    tracing::debug!(from = %staged.display(), to = %target.display(), "rename failed; copying payload");
    copy_tree(staged, target)?;
    fs::remove_dir_all(staged)
        .with_context(|| format!("failed to clear staged payload {}", staged.display()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source_dir, dest_dir)) = pending.pop() {
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let entries = fs::read_dir(&source_dir)
            .with_context(|| format!("failed to list {}", source_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", source_dir.display()))?;
            let source = entry.path();
            let dest = dest_dir.join(entry.file_name());
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to inspect {}", source.display()))?;

            if file_type.is_dir() {
                pending.push((source, dest));
            } else if file_type.is_symlink() {
                copy_link(&source, &dest)?;
            } else {
                fs::copy(&source, &dest).with_context(|| {
                    format!("failed to copy {} into {}", source.display(), dest.display())
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(source: &Path, dest: &Path) -> Result<()> {
    let link = fs::read_link(source)
        .with_context(|| format!("failed to read link {}", source.display()))?;
    std::os::unix::fs::symlink(&link, dest)
        .with_context(|| format!("failed to recreate link {}", dest.display()))
}

#[cfg(not(unix))]
fn copy_link(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} into {}", source.display(), dest.display()))
}
