use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use toolnest_core::{ArchiveType, ArtifactFamily};

use crate::error::InstallError;
use crate::fs_utils::{dir_is_populated, relocate_dir, remove_dir_if_exists, remove_file_if_exists};
use crate::native::NativeInstaller;
use crate::ToolLayout;

/// Directory names that mark a payload root when found as the only child.
const LAYOUT_DIR_NAMES: &[&str] = &["bin", "lib", "share", "include", "libexec", "sbin"];

const BINARY_EXTENSIONS: &[&str] = &["exe", "dll", "bat", "cmd", "ps1", "sh"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub name: String,
    pub version: String,
    pub target: PathBuf,
    pub bytes_installed: u64,
    pub elapsed: Duration,
    /// Archive entries rejected or not written, by their in-archive path.
    pub skipped_entries: Vec<String>,
}

/// Installs `artifact_path` into the package directory, choosing the
/// extractor or native installer from the artifact's extension.
pub fn install_from_artifact(
    layout: &ToolLayout,
    name: &str,
    version: &str,
    artifact_path: &Path,
    native: &dyn NativeInstaller,
) -> Result<InstallReport, InstallError> {
    run_install(layout, name, version, artifact_path, |archive_type, target| {
        match archive_type.family() {
            ArtifactFamily::Archive => {
                extract_archive_into(layout, name, artifact_path, archive_type, target)
            }
            ArtifactFamily::Native => {
                run_native_install(name, artifact_path, archive_type, target, native)
            }
        }
    })
}

/// Installs through the platform installer regardless of extension.
pub fn install_with_native(
    layout: &ToolLayout,
    name: &str,
    version: &str,
    artifact_path: &Path,
    native: &dyn NativeInstaller,
) -> Result<InstallReport, InstallError> {
    run_install(layout, name, version, artifact_path, |archive_type, target| {
        run_native_install(name, artifact_path, archive_type, target, native)
    })
}

fn run_install<Stage>(
    layout: &ToolLayout,
    name: &str,
    version: &str,
    artifact_path: &Path,
    stage: Stage,
) -> Result<InstallReport, InstallError>
where
    Stage: FnOnce(ArchiveType, &Path) -> Result<Vec<String>, InstallError>,
{
    let started = Instant::now();
    let bytes_installed = fs::metadata(artifact_path)
        .map(|metadata| metadata.len())
        .unwrap_or(0);

    let result = (|| -> Result<(PathBuf, Vec<String>), InstallError> {
        let target = layout.checked_package_dir(name)?;
        remove_dir_if_exists(&target).map_err(InstallError::io(&target))?;

        let file_name = artifact_path
            .file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive_type = ArchiveType::infer_from_file_name(&file_name)
            .ok_or(InstallError::UnsupportedFormat { file_name })?;
        tracing::info!(package = name, version, artifact = %artifact_path.display(), kind = archive_type.as_str(), "installing");

        let skipped_entries = stage(archive_type, &target)?;
        if !dir_is_populated(&target) {
            return Err(InstallError::EmptyInstall {
                name: name.to_string(),
            });
        }
        Ok((target, skipped_entries))
    })();

    if let Err(err) = remove_file_if_exists(artifact_path) {
        tracing::warn!(path = %artifact_path.display(), error = %err, "failed to remove installed artifact");
    }

    let (target, skipped_entries) = result?;
    Ok(InstallReport {
        name: name.to_string(),
        version: version.to_string(),
        target,
        bytes_installed,
        elapsed: started.elapsed(),
        skipped_entries,
    })
}

fn run_native_install(
    name: &str,
    artifact_path: &Path,
    archive_type: ArchiveType,
    target: &Path,
    native: &dyn NativeInstaller,
) -> Result<Vec<String>, InstallError> {
    fs::create_dir_all(target).map_err(InstallError::io(target))?;
    native
        .install(artifact_path, archive_type, target)
        .map_err(|err| InstallError::Native {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })?;
    Ok(Vec::new())
}

fn extract_archive_into(
    layout: &ToolLayout,
    name: &str,
    artifact_path: &Path,
    archive_type: ArchiveType,
    target: &Path,
) -> Result<Vec<String>, InstallError> {
    let staging = make_tmp_dir(layout, name)?;
    let raw_dir = staging.join("raw");
    fs::create_dir_all(&raw_dir).map_err(InstallError::io(&raw_dir))?;

    let result = (|| -> Result<Vec<String>, InstallError> {
        let skipped = match archive_type {
            ArchiveType::Zip => extract_zip(artifact_path, &raw_dir)?,
            ArchiveType::TarGz => {
                let file = File::open(artifact_path).map_err(InstallError::io(artifact_path))?;
                extract_tar(GzDecoder::new(BufReader::new(file)), artifact_path, &raw_dir)?
            }
            ArchiveType::Tar => {
                let file = File::open(artifact_path).map_err(InstallError::io(artifact_path))?;
                extract_tar(BufReader::new(file), artifact_path, &raw_dir)?
            }
            ArchiveType::Gz => {
                extract_gzip_file(artifact_path, &raw_dir)?;
                Vec::new()
            }
            ArchiveType::Msi | ArchiveType::Exe => {
                return Err(InstallError::UnsupportedFormat {
                    file_name: artifact_path.display().to_string(),
                })
            }
        };

        let payload_root = find_payload_root(&raw_dir);
        if payload_root != raw_dir {
            tracing::debug!(
                package = name,
                root = %payload_root.strip_prefix(&raw_dir).unwrap_or(&payload_root).display(),
                "normalized nested archive root"
            );
        }
        relocate_dir(&payload_root, target)
            .map_err(InstallError::filesystem("failed to move extracted payload"))?;
        Ok(skipped)
    })();

    if let Err(err) = remove_dir_if_exists(&staging) {
        tracing::warn!(path = %staging.display(), error = %err, "failed to remove extraction staging dir");
    }
    result
}

fn make_tmp_dir(layout: &ToolLayout, name: &str) -> Result<PathBuf, InstallError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let dir = layout
        .tmp_dir()
        .join(format!("extract-{name}-{}-{nanos}", std::process::id()));
    fs::create_dir_all(&dir).map_err(InstallError::io(&dir))?;
    Ok(dir)
}

/// Relative path for an archive entry, or `None` when the entry would land
/// outside the extraction directory.
pub(crate) fn safe_entry_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }

    let mut path = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().contains(':') {
                    return None;
                }
                path.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if path.as_os_str().is_empty() {
        return None;
    }
    Some(path)
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<Vec<String>, InstallError> {
    let file = File::open(archive_path).map_err(InstallError::io(archive_path))?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|err| InstallError::Extraction {
            path: archive_path.to_path_buf(),
            reason: err.to_string(),
        })?;

    let mut skipped = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(archive = %archive_path.display(), index, error = %err, "skipping unreadable zip entry");
                skipped.push(format!("#{index}"));
                continue;
            }
        };
        let entry_name = entry.name().to_string();
        let Some(relative) = safe_entry_path(&entry_name) else {
            tracing::warn!(entry = %entry_name, "rejected archive entry outside target");
            skipped.push(entry_name);
            continue;
        };
        let out_path = dst.join(&relative);

        let written = if entry.is_dir() {
            fs::create_dir_all(&out_path)
        } else {
            write_entry(&mut entry, &out_path)
        };
        if let Err(err) = written {
            tracing::warn!(entry = %entry_name, error = %err, "failed to extract archive entry");
            skipped.push(entry_name);
            continue;
        }

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;

            if let Err(err) = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode)) {
                tracing::warn!(entry = %entry_name, mode, error = %err, "failed to apply archive entry permissions");
            }
        }
    }
    Ok(skipped)
}

fn write_entry(reader: &mut impl io::Read, out_path: &Path) -> io::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(out_path)?;
    io::copy(reader, &mut out)?;
    Ok(())
}

fn extract_tar<R: io::Read>(
    reader: R,
    archive_path: &Path,
    dst: &Path,
) -> Result<Vec<String>, InstallError> {
    let extraction_error = |err: io::Error| InstallError::Extraction {
        path: archive_path.to_path_buf(),
        reason: err.to_string(),
    };

    let mut archive = tar::Archive::new(reader);
    let mut skipped = Vec::new();
    for entry in archive.entries().map_err(extraction_error)? {
        let mut entry = entry.map_err(extraction_error)?;
        let entry_name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(err) => {
                tracing::warn!(error = %err, "skipping tar entry with unreadable path");
                skipped.push("<invalid path>".to_string());
                continue;
            }
        };
        let Some(relative) = safe_entry_path(&entry_name) else {
            tracing::warn!(entry = %entry_name, "rejected archive entry outside target");
            skipped.push(entry_name);
            continue;
        };

        let entry_type = entry.header().entry_type();
        let link_target = if entry_type.is_symlink() || entry_type.is_hard_link() {
            let link = entry
                .link_name()
                .ok()
                .flatten()
                .map(|link| link.to_string_lossy().into_owned());
            let resolved = link.as_deref().and_then(|link| {
                if entry_type.is_hard_link() {
                    safe_entry_path(link)
                } else {
                    resolve_symlink_target(&relative, link)
                }
            });
            let Some(resolved) = resolved else {
                tracing::warn!(entry = %entry_name, link = ?link, "rejected archive link pointing outside target");
                skipped.push(entry_name);
                continue;
            };
            Some(resolved)
        } else {
            None
        };

        let out_path = dst.join(&relative);
        let unpacked = out_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| match link_target {
                // Hard-link sources are archive paths, so they resolve under
                // `dst` rather than the working directory.
                Some(source) if entry_type.is_hard_link() => {
                    remove_file_if_exists(&out_path)?;
                    fs::hard_link(dst.join(source), &out_path)
                }
                _ => entry.unpack(&out_path).map(|_| ()),
            });
        if let Err(err) = unpacked {
            tracing::warn!(entry = %entry_name, error = %err, "failed to extract archive entry");
            skipped.push(entry_name);
        }
    }
    Ok(skipped)
}

/// Resolves a symlink target against the link's own directory. `None` when
/// the target is absolute or climbs above the extraction root.
pub(crate) fn resolve_symlink_target(link_path: &Path, target: &str) -> Option<PathBuf> {
    let normalized = target.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }

    let mut resolved = link_path.parent().map(Path::to_path_buf).unwrap_or_default();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().contains(':') {
                    return None;
                }
                resolved.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn extract_gzip_file(archive_path: &Path, dst: &Path) -> Result<(), InstallError> {
    let file_name = archive_path
        .file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = file_name.to_ascii_lowercase();
    let output_name = match lower.strip_suffix(".gz") {
        Some(stem) if !stem.is_empty() => file_name[..stem.len()].to_string(),
        _ => "payload".to_string(),
    };

    let file = File::open(archive_path).map_err(InstallError::io(archive_path))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let out_path = dst.join(output_name);
    write_entry(&mut decoder, &out_path).map_err(|err| InstallError::Extraction {
        path: archive_path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Descends through lone wrapper directories until a directory holding
/// binaries, several entries, or a conventional layout folder is reached.
pub(crate) fn find_payload_root(dir: &Path) -> PathBuf {
    let mut current = dir.to_path_buf();
    loop {
        if has_binary_artifacts(&current) {
            return current;
        }

        let Ok(entries) = fs::read_dir(&current) else {
            return current;
        };
        let entries = entries.filter_map(Result::ok).collect::<Vec<_>>();
        let [only] = entries.as_slice() else {
            return current;
        };
        let is_dir = only.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        let name = only.file_name().to_string_lossy().to_ascii_lowercase();
        if !is_dir || LAYOUT_DIR_NAMES.contains(&name.as_str()) {
            return current;
        }
        current = only.path();
    }
}

fn has_binary_artifacts(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(Result::ok).any(|entry| {
        let Ok(metadata) = entry.metadata() else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        let path = entry.path();
        let by_extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.as_str()));
        by_extension || is_executable(&metadata)
    })
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
