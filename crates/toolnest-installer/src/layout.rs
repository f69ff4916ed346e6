use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use toolnest_core::validate_package_name;

use crate::error::InstallError;

pub const STORE_FILE_NAME: &str = "installed.json";
pub const ENV_FILE_NAME: &str = "sdk.env";
pub const CONFIG_FILE_NAME: &str = "toolnest.toml";

/// Directory tree owned by one toolnest root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLayout {
    root: PathBuf,
}

impl ToolLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.tools_dir().join(name)
    }

    /// `package_dir` for names that resolve to a direct child of `tools/`.
    /// Anything that would install or delete elsewhere is refused.
    pub fn checked_package_dir(&self, name: &str) -> std::result::Result<PathBuf, InstallError> {
        validate_package_name(name).map_err(|err| InstallError::InvalidName {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })?;
        Ok(self.package_dir(name))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.downloads_dir().join(file_name)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE_NAME)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.root.join(ENV_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.tools_dir(), self.downloads_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user root")?;
        return Ok(PathBuf::from(app_data).join("Toolnest"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user root")?;
    Ok(PathBuf::from(home).join(".toolnest"))
}
