use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use toolnest_core::InstalledRecord;
use toolnest_resolver::RecordStore;

use crate::error::StoreError;

/// Durable per-package version records, loaded wholesale and rewritten
/// wholesale after every mutation.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
    records: BTreeMap<String, InstalledRecord>,
}

impl VersionStore {
    /// Loads the store at `path`. A missing or blank file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let records = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str::<Vec<InstalledRecord>>(&raw).map_err(|source| {
                StoreError::Parse {
                    path: path.clone(),
                    source,
                }
            })?
        };

        Ok(Self {
            path,
            records: records
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records sorted by package name.
    pub fn all(&self) -> impl Iterator<Item = &InstalledRecord> {
        self.records.values()
    }

    pub fn get(&self, name: &str) -> Option<&InstalledRecord> {
        self.records.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_install(&mut self, name: &str, version: &str) -> Result<(), StoreError> {
        self.record_install_at(name, version, Utc::now())
    }

    /// Replaces any existing record with a fresh one (`update_count` 0, no
    /// history).
    pub fn record_install_at(
        &mut self,
        name: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.records
            .insert(name.to_string(), InstalledRecord::new(name, version, now));
        self.save()
    }

    pub fn record_update(&mut self, name: &str, new_version: &str) -> Result<(), StoreError> {
        self.record_update_at(name, new_version, Utc::now())
    }

    /// Appends one history entry. Unknown names are recorded as installs.
    pub fn record_update_at(
        &mut self,
        name: &str,
        new_version: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.records.get_mut(name) {
            Some(record) => {
                record.apply_update(new_version, now);
                self.save()
            }
            None => self.record_install_at(name, new_version, now),
        }
    }

    /// Drops the record for `name`. Returns whether one existed.
    pub fn remove(&mut self, name: &str) -> Result<bool, StoreError> {
        if self.records.remove(name).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<(), StoreError> {
        // Going through `Value` sorts object keys.
        let value = serde_json::to_value(self.records.values().collect::<Vec<_>>())?;
        let mut rendered = serde_json::to_string_pretty(&value)?;
        rendered.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, rendered).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl RecordStore for VersionStore {
    fn records(&self) -> Vec<InstalledRecord> {
        self.records.values().cloned().collect()
    }

    fn prune(&mut self, name: &str) -> anyhow::Result<()> {
        self.remove(name)?;
        Ok(())
    }
}
