use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use toolnest_core::ArchiveType;

/// Platform installer collaborator for `.msi` / `.exe` artifacts.
pub trait NativeInstaller: Send + Sync {
    /// Runs the installer so that its payload lands in `target_dir`.
    fn install(&self, artifact_path: &Path, archive_type: ArchiveType, target_dir: &Path)
        -> Result<()>;
}

/// Unattended, per-user invocation of the Windows installers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentNativeInstaller;

impl NativeInstaller for SilentNativeInstaller {
    fn install(
        &self,
        artifact_path: &Path,
        archive_type: ArchiveType,
        target_dir: &Path,
    ) -> Result<()> {
        if !cfg!(windows) {
            return Err(anyhow!(
                "{} installers are supported only on Windows hosts",
                archive_type.as_str().to_ascii_uppercase()
            ));
        }

        let mut command = build_native_install_command(artifact_path, archive_type, target_dir)?;
        tracing::info!(command = ?command, "running native installer");
        run_command(
            &mut command,
            &format!(
                "failed to run {} installer {}",
                archive_type.as_str(),
                artifact_path.display()
            ),
        )
    }
}

pub(crate) fn build_native_install_command(
    artifact_path: &Path,
    archive_type: ArchiveType,
    target_dir: &Path,
) -> Result<Command> {
    match archive_type {
        ArchiveType::Msi => Ok(build_msi_install_command(artifact_path, target_dir)),
        ArchiveType::Exe => Ok(build_exe_install_command(artifact_path, target_dir)),
        other => Err(anyhow!(
            "'{}' artifacts have no native installer",
            other.as_str()
        )),
    }
}

pub(crate) fn build_msi_install_command(artifact_path: &Path, target_dir: &Path) -> Command {
    let mut command = Command::new("msiexec");
    command
        .arg("/a")
        .arg(artifact_path)
        .arg("/qb")
        .arg(format!("TARGETDIR={}", target_dir.display()));
    command
}

pub(crate) fn build_exe_install_command(artifact_path: &Path, target_dir: &Path) -> Command {
    let mut command = Command::new(artifact_path);
    command
        .arg("/VERYSILENT")
        .arg("/CURRENTUSER")
        .arg("/NORESTART")
        .arg(format!("/DIR={}", target_dir.display()));
    command
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
