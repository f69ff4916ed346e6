use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure category a session uses to decide between retrying, purging and
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientNetwork,
    Integrity,
    Install,
    State,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "network",
            Self::Integrity => "integrity",
            Self::Install => "install",
            Self::State => "state",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("server did not report a content length for {url}")]
    SizeUnknown { url: String },

    #[error("downloaded chunks are incomplete: {detail}")]
    CorruptChunks { detail: String },

    #[error("assembled download is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("sha256 of {} does not match expected {expected}", path.display())]
    HashMismatch { path: PathBuf, expected: String },

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("failed to build http client: {0}")]
    Client(String),
}

impl DownloadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } | Self::SizeUnknown { .. } => ErrorClass::TransientNetwork,
            Self::CorruptChunks { .. } | Self::SizeMismatch { .. } | Self::HashMismatch { .. } => {
                ErrorClass::Integrity
            }
            Self::Io { .. } | Self::Client(_) => ErrorClass::State,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Only probe and transfer failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("refusing package '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("unsupported artifact format: {file_name}")]
    UnsupportedFormat { file_name: String },

    #[error("installation of '{name}' produced an empty directory")]
    EmptyInstall { name: String },

    #[error("failed to extract {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    #[error("native installer failed for '{name}': {reason}")]
    Native { name: String, reason: String },

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {reason}")]
    Filesystem { context: String, reason: String },
}

impl InstallError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Install
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn filesystem(context: impl Into<String>) -> impl FnOnce(anyhow::Error) -> Self {
        let context = context.into();
        move |err| Self::Filesystem {
            context,
            reason: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read version store {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse version store {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize version store: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write version store {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::State
    }
}
