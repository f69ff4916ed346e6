use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ToolLayout;

pub const SDK_ROOT_KEY: &str = "SDK_ROOT";

/// `NODE JS` becomes `NODE_JS`.
pub fn env_var_prefix(package_name: &str) -> String {
    package_name.to_uppercase().replace(' ', "_")
}

/// Renders the environment export file for the given installed packages.
/// `SDK_ROOT` is the absolute tool root. Packages are written in name order;
/// `_BIN` / `_LIB` only appear when the subdirectory exists.
pub fn render_env_file<'a>(layout: &ToolLayout, packages: impl IntoIterator<Item = &'a str>) -> String {
    let names = packages.into_iter().collect::<BTreeSet<_>>();
    let tools_dir = layout.tools_dir();
    let tool_root = std::path::absolute(&tools_dir).unwrap_or(tools_dir);

    let mut out = String::new();
    out.push_str("# Toolnest SDK environment variables\n");
    out.push_str("# This file is auto-generated - DO NOT EDIT MANUALLY\n\n");
    out.push_str(&format!("{SDK_ROOT_KEY}={}\n", tool_root.display()));

    for name in names {
        let home = tool_root.join(name);
        let prefix = env_var_prefix(name);
        out.push('\n');
        out.push_str(&format!("{prefix}_HOME={}\n", home.display()));
        for (suffix, dir) in [("BIN", home.join("bin")), ("LIB", home.join("lib"))] {
            if dir.is_dir() {
                out.push_str(&format!("{prefix}_{suffix}={}\n", dir.display()));
            }
        }
    }
    out
}

/// Rewrites the environment file wholesale and returns its path.
pub fn write_env_file<'a>(
    layout: &ToolLayout,
    packages: impl IntoIterator<Item = &'a str>,
) -> Result<PathBuf> {
    let path = layout.env_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, render_env_file(layout, packages))
        .with_context(|| format!("failed to write environment file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "environment file regenerated");
    Ok(path)
}

/// `KEY=VALUE` pairs in file order. Comments and blank lines are skipped;
/// values may contain `=`.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read environment file {}", path.display()))?;
    Ok(parse_env_file(&content))
}
