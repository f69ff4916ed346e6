use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use toolnest_core::ArtifactFamily;
use toolnest_installer::{default_user_root, DownloadOptions, ToolLayout};

use crate::session::RetryPolicy;

pub const ROOT_ENV: &str = "TOOLNEST_ROOT";
pub const CATALOG_URL_ENV: &str = "TOOLNEST_CATALOG_URL";

const CATALOG_URL_GUIDANCE: &str = "no catalog configured; set catalog_url in toolnest.toml, export TOOLNEST_CATALOG_URL, or pass --catalog-url";

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub root: PathBuf,
    pub catalog_url: Option<String>,
    pub download: DownloadOptions,
    pub retry: RetryPolicy,
    pub families: BTreeMap<String, ArtifactFamily>,
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub root: Option<PathBuf>,
    pub catalog_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    catalog_url: Option<String>,
    #[serde(default)]
    download: DownloadSection,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    families: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadSection {
    segments: Option<usize>,
    min_segment_bytes: Option<u64>,
    transfer_block_bytes: Option<usize>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

impl Config {
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        Self::load_with_env(cli, |key| std::env::var(key).ok())
    }

    /// Defaults, then `<root>/toolnest.toml`, then the environment, then
    /// `cli`. The root itself never comes from the file.
    pub fn load_with_env(
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let root = match (&cli.root, env(ROOT_ENV)) {
            (Some(root), _) => root.clone(),
            (None, Some(root)) => PathBuf::from(root),
            (None, None) => default_user_root()?,
        };
        let config_path = ToolLayout::new(&root).config_path();
        let file = read_config_file(&config_path)?;

        let mut config = Self::from_file(root, file)
            .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
        if let Some(url) = env(CATALOG_URL_ENV) {
            config.catalog_url = Some(url);
        }
        if let Some(url) = &cli.catalog_url {
            config.catalog_url = Some(url.clone());
        }
        Ok(config)
    }

    fn from_file(root: PathBuf, file: ConfigFile) -> Result<Self> {
        let defaults = DownloadOptions::default();
        let download = DownloadOptions {
            segments: positive(file.download.segments, defaults.segments, "download.segments")?,
            min_segment_bytes: positive(
                file.download.min_segment_bytes,
                defaults.min_segment_bytes,
                "download.min_segment_bytes",
            )?,
            transfer_block_bytes: positive(
                file.download.transfer_block_bytes,
                defaults.transfer_block_bytes,
                "download.transfer_block_bytes",
            )?,
            connect_timeout: file
                .download
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            user_agent: defaults.user_agent,
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: positive(
                file.retry.max_attempts,
                retry_defaults.max_attempts,
                "retry.max_attempts",
            )?,
            initial_backoff: file
                .retry
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.initial_backoff),
            max_backoff: file
                .retry
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_backoff),
        };
        if retry.max_backoff < retry.initial_backoff {
            return Err(anyhow!(
                "retry.max_backoff_ms must not be lower than retry.initial_backoff_ms"
            ));
        }

        let mut families = BTreeMap::new();
        for (package, family) in file.families {
            let parsed = ArtifactFamily::parse(&family).ok_or_else(|| {
                anyhow!(
                    "families.{package}: unknown installer family '{family}' (expected 'archive' or 'native')"
                )
            })?;
            families.insert(package, parsed);
        }

        Ok(Self {
            root,
            catalog_url: file
                .catalog_url
                .filter(|url| !url.trim().is_empty()),
            download,
            retry,
            families,
        })
    }

    pub fn layout(&self) -> ToolLayout {
        ToolLayout::new(&self.root)
    }

    pub fn require_catalog_url(&self) -> Result<&str> {
        self.catalog_url
            .as_deref()
            .ok_or_else(|| anyhow!(CATALOG_URL_GUIDANCE))
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    };
    parse_config_file(&raw).with_context(|| format!("invalid configuration in {}", path.display()))
}

fn parse_config_file(raw: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(raw)?)
}

fn positive<T>(value: Option<T>, default: T, key: &str) -> Result<T>
where
    T: Copy + PartialEq + Default,
{
    match value {
        Some(value) if value == T::default() => Err(anyhow!("{key} must be greater than zero")),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

