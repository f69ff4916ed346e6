use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use toolnest_core::Catalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    Remote(String),
    Local(PathBuf),
}

impl CatalogSource {
    /// `http(s)://` is fetched over the network; `file://` URLs and bare
    /// paths are read from disk.
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Self::Remote(trimmed.to_string());
        }
        match trimmed.strip_prefix("file://") {
            Some(path) => Self::Local(PathBuf::from(path)),
            None => Self::Local(PathBuf::from(trimmed)),
        }
    }
}

pub fn fetch_catalog(source: &str, connect_timeout: Duration) -> Result<Catalog> {
    let raw = match CatalogSource::parse(source) {
        CatalogSource::Remote(url) => fetch_remote_catalog(&url, connect_timeout)?,
        CatalogSource::Local(path) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?,
    };

    let catalog = Catalog::from_json_str(&raw)
        .with_context(|| format!("catalog from {source} is invalid"))?;
    tracing::debug!(source, packages = catalog.len(), "catalog loaded");
    Ok(catalog)
}

fn fetch_remote_catalog(url: &str, connect_timeout: Duration) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("toolnest/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build http client")?;

    client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text())
        .with_context(|| format!("failed to fetch catalog from {url}"))
}
