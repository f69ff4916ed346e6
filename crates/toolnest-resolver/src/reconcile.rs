use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use toolnest_core::{Action, Catalog, InstalledRecord, UNKNOWN_VERSION};

/// Persisted installed-version records, as seen by the reconciler.
pub trait RecordStore {
    fn records(&self) -> Vec<InstalledRecord>;
    fn prune(&mut self, name: &str) -> Result<()>;
}

/// Read-only view of the package directories under the tool root.
pub trait ToolDirectoryLister {
    /// Package directory names in discovery order.
    fn package_dirs(&self) -> Result<Vec<String>>;
    /// True when the package directory exists and holds at least one entry.
    fn is_populated(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSource {
    Recorded,
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPackage {
    pub name: String,
    pub version: String,
    pub source: LocalSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub actions: Vec<Action>,
    pub local: Vec<LocalPackage>,
    pub up_to_date: Vec<String>,
    pub pruned: Vec<String>,
    pub warnings: Vec<String>,
}

impl Reconciliation {
    pub fn is_up_to_date(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn local_version(&self, name: &str) -> Option<&str> {
        self.local
            .iter()
            .find(|package| package.name == name)
            .map(|package| package.version.as_str())
    }

    pub fn action_for(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|action| action.name() == name)
    }
}

/// Diffs the catalog against installed records and the tool directories.
///
/// Records whose directory is gone or empty are pruned from `store` before
/// the diff. Populated directories without a record are treated as
/// installed at [`UNKNOWN_VERSION`]. Install and upgrade actions come first
/// in catalog order, followed by removals in discovery order.
pub fn reconcile(
    catalog: &Catalog,
    store: &mut dyn RecordStore,
    tools: &dyn ToolDirectoryLister,
) -> Result<Reconciliation> {
    let remote_names: HashSet<&str> = catalog
        .packages()
        .iter()
        .map(|package| package.name.as_str())
        .collect();

    let mut result = Reconciliation::default();
    let mut local_index: BTreeMap<String, usize> = BTreeMap::new();

    for record in store.records() {
        if !tools.is_populated(&record.name) {
            tracing::info!(package = %record.name, "pruning installed record without tool directory");
            if let Err(err) = store.prune(&record.name) {
                result.warnings.push(format!(
                    "failed to prune stale record '{}': {err:#}",
                    record.name
                ));
            }
            result.pruned.push(record.name);
            continue;
        }
        if local_index.contains_key(&record.name) {
            continue;
        }
        local_index.insert(record.name.clone(), result.local.len());
        result.local.push(LocalPackage {
            name: record.name,
            version: record.version,
            source: LocalSource::Recorded,
        });
    }

    for name in tools.package_dirs()? {
        if local_index.contains_key(&name) || !tools.is_populated(&name) {
            continue;
        }
        tracing::debug!(package = %name, "found tool directory without installed record");
        local_index.insert(name.clone(), result.local.len());
        result.local.push(LocalPackage {
            name,
            version: UNKNOWN_VERSION.to_string(),
            source: LocalSource::Discovered,
        });
    }

    for package in catalog.packages() {
        let local = local_index
            .get(&package.name)
            .map(|index| &result.local[*index]);
        match local {
            None => result.actions.push(Action::Install {
                name: package.name.clone(),
                version: package.version.clone(),
            }),
            Some(local) if local.version != package.version => {
                result.actions.push(Action::Upgrade {
                    name: package.name.clone(),
                    from_version: local.version.clone(),
                    to_version: package.version.clone(),
                })
            }
            Some(_) => result.up_to_date.push(package.name.clone()),
        }
    }

    for local in &result.local {
        if remote_names.contains(local.name.as_str()) {
            continue;
        }
        result.actions.push(Action::Remove {
            name: local.name.clone(),
            version: local.version.clone(),
        });
    }

    Ok(result)
}
