use std::collections::HashSet;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl PackageDescriptor {
    /// Last path segment of the download URL, without query or fragment.
    pub fn artifact_file_name(&self) -> anyhow::Result<String> {
        let without_fragment = self.url.split('#').next().unwrap_or(&self.url);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        let file_name = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("");
        if file_name.is_empty() || file_name.contains("..") || file_name.contains('\\') {
            return Err(anyhow!(
                "cannot derive artifact file name from URL '{}' for package '{}'",
                self.url,
                self.name
            ));
        }
        Ok(file_name.to_string())
    }

    /// Expected hash, ignoring blank values some catalogs ship.
    pub fn expected_hash(&self) -> Option<&str> {
        self.hash
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Remote list of installable packages, in the order the catalog lists them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    packages: Vec<PackageDescriptor>,
}

/// A package name is used as one directory under the tool root, so it must
/// be a single plain path component.
pub fn validate_package_name(name: &str) -> anyhow::Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("catalog entry has an empty name"));
    }
    if name.starts_with('.')
        || name
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | ':' | '\0'))
    {
        return Err(anyhow!(
            "package name '{name}' is not a plain directory name"
        ));
    }
    Ok(())
}

impl Catalog {
    pub fn new(packages: Vec<PackageDescriptor>) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for package in &packages {
            validate_package_name(&package.name)?;
            if package.version.trim().is_empty() {
                return Err(anyhow!(
                    "catalog entry '{}' has an empty version",
                    package.name
                ));
            }
            if package.url.trim().is_empty() {
                return Err(anyhow!("catalog entry '{}' has an empty url", package.name));
            }
            if !seen.insert(package.name.as_str()) {
                return Err(anyhow!("duplicate catalog entry '{}'", package.name));
            }
        }
        Ok(Self { packages })
    }

    pub fn from_json_str(input: &str) -> anyhow::Result<Self> {
        let packages: Vec<PackageDescriptor> =
            serde_json::from_str(input).context("failed to parse package catalog")?;
        Self::new(packages)
    }

    pub fn packages(&self) -> &[PackageDescriptor] {
        &self.packages
    }

    pub fn get(&self, name: &str) -> Option<&PackageDescriptor> {
        self.packages.iter().find(|package| package.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
