use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ToolDirectoryLister;

/// Tool directories read straight from the filesystem.
#[derive(Debug, Clone)]
pub struct FsToolDirectory {
    root: PathBuf,
}

impl FsToolDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ToolDirectoryLister for FsToolDirectory {
    fn package_dirs(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read tool root: {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    fn is_populated(&self, name: &str) -> bool {
        fs::read_dir(self.root.join(name))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}
