mod action;
mod archive;
mod catalog;
mod record;

pub use action::Action;
pub use archive::{ArchiveType, ArtifactFamily};
pub use catalog::{validate_package_name, Catalog, PackageDescriptor};
pub use record::{InstalledRecord, VersionHistoryEntry, UNKNOWN_VERSION};
