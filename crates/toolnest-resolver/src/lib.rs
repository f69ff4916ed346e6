mod local;
mod pin;
mod reconcile;

pub use local::FsToolDirectory;
pub use pin::{version_direction, version_satisfies_pin, VersionDirection};
pub use reconcile::{
    reconcile, LocalPackage, LocalSource, Reconciliation, RecordStore, ToolDirectoryLister,
};
