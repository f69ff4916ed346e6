use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use toolnest_core::ArtifactFamily;

use crate::artifact::{install_from_artifact, install_with_native, InstallReport};
use crate::error::InstallError;
use crate::fs_utils::{dir_is_populated, remove_dir_if_exists};
use crate::native::NativeInstaller;
use crate::ToolLayout;

/// Install capability for one family of packages.
pub trait PackageHandler: Send + Sync {
    fn family(&self) -> ArtifactFamily;

    fn install(
        &self,
        layout: &ToolLayout,
        name: &str,
        version: &str,
        artifact_path: &Path,
    ) -> Result<InstallReport, InstallError>;

    /// Full-replace reinstall unless a family knows better.
    fn update(
        &self,
        layout: &ToolLayout,
        name: &str,
        version: &str,
        artifact_path: &Path,
    ) -> Result<InstallReport, InstallError> {
        self.install(layout, name, version, artifact_path)
    }

    fn uninstall(&self, layout: &ToolLayout, name: &str) -> Result<(), InstallError> {
        let dir = layout.checked_package_dir(name)?;
        remove_dir_if_exists(&dir).map_err(InstallError::io(&dir))?;
        tracing::info!(package = name, path = %dir.display(), "removed package directory");
        Ok(())
    }

    fn is_installed(&self, layout: &ToolLayout, name: &str) -> bool {
        layout
            .checked_package_dir(name)
            .is_ok_and(|dir| dir_is_populated(&dir))
    }
}

/// Picks extraction or the native installer from the artifact extension.
pub struct ArtifactHandler {
    native: Arc<dyn NativeInstaller>,
}

impl ArtifactHandler {
    pub fn new(native: Arc<dyn NativeInstaller>) -> Self {
        Self { native }
    }
}

impl PackageHandler for ArtifactHandler {
    fn family(&self) -> ArtifactFamily {
        ArtifactFamily::Archive
    }

    fn install(
        &self,
        layout: &ToolLayout,
        name: &str,
        version: &str,
        artifact_path: &Path,
    ) -> Result<InstallReport, InstallError> {
        install_from_artifact(layout, name, version, artifact_path, self.native.as_ref())
    }
}

/// Always hands the artifact to the platform installer.
pub struct NativeHandler {
    native: Arc<dyn NativeInstaller>,
}

impl NativeHandler {
    pub fn new(native: Arc<dyn NativeInstaller>) -> Self {
        Self { native }
    }
}

impl PackageHandler for NativeHandler {
    fn family(&self) -> ArtifactFamily {
        ArtifactFamily::Native
    }

    fn install(
        &self,
        layout: &ToolLayout,
        name: &str,
        version: &str,
        artifact_path: &Path,
    ) -> Result<InstallReport, InstallError> {
        install_with_native(layout, name, version, artifact_path, self.native.as_ref())
    }
}

/// Handler lookup keyed by package name, falling back to a default.
pub struct HandlerRegistry {
    native: Arc<dyn NativeInstaller>,
    default: Arc<dyn PackageHandler>,
    overrides: BTreeMap<String, Arc<dyn PackageHandler>>,
}

impl HandlerRegistry {
    pub fn new(native: Arc<dyn NativeInstaller>) -> Self {
        Self {
            default: Arc::new(ArtifactHandler::new(Arc::clone(&native))),
            native,
            overrides: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn PackageHandler>) {
        self.overrides.insert(name.into(), handler);
    }

    pub fn register_family(&mut self, name: impl Into<String>, family: ArtifactFamily) {
        let handler: Arc<dyn PackageHandler> = match family {
            ArtifactFamily::Archive => Arc::new(ArtifactHandler::new(Arc::clone(&self.native))),
            ArtifactFamily::Native => Arc::new(NativeHandler::new(Arc::clone(&self.native))),
        };
        self.register(name, handler);
    }

    pub fn handler_for(&self, name: &str) -> &dyn PackageHandler {
        self.overrides
            .get(name)
            .unwrap_or(&self.default)
            .as_ref()
    }
}
