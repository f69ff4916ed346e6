mod artifact;
mod chunks;
mod download;
mod env_file;
mod error;
mod fs_utils;
mod handlers;
mod layout;
mod native;
mod store;

pub use artifact::{install_from_artifact, install_with_native, InstallReport};
pub use chunks::{chunk_dir_for, chunk_file_name, plan_chunks, ChunkRange};
pub use download::{
    CancelToken, DownloadOptions, DownloadOutcome, ProgressFn, SegmentedDownloader,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MIN_SEGMENT_BYTES, DEFAULT_SEGMENTS,
    DEFAULT_TRANSFER_BLOCK_BYTES,
};
pub use env_file::{
    env_var_prefix, parse_env_file, read_env_file, render_env_file, write_env_file, SDK_ROOT_KEY,
};
pub use error::{DownloadError, ErrorClass, InstallError, StoreError};
pub use fs_utils::{dir_is_populated, remove_dir_if_exists, remove_file_if_exists};
pub use handlers::{ArtifactHandler, HandlerRegistry, NativeHandler, PackageHandler};
pub use layout::{default_user_root, ToolLayout, CONFIG_FILE_NAME, ENV_FILE_NAME, STORE_FILE_NAME};
pub use native::{NativeInstaller, SilentNativeInstaller};
pub use store::VersionStore;

#[cfg(test)]
mod tests;
