use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version reported for tool directories that have no installed record.
pub const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionHistoryEntry {
    pub from_version: String,
    pub to_version: String,
    pub update_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    pub installed_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default)]
    pub version_history: Vec<VersionHistoryEntry>,
}

impl InstalledRecord {
    pub fn new(name: &str, version: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            previous_version: None,
            installed_date: now,
            last_updated: now,
            update_count: 0,
            version_history: Vec::new(),
        }
    }

    /// Moves the record to `new_version`, appending exactly one history entry.
    pub fn apply_update(&mut self, new_version: &str, now: DateTime<Utc>) {
        let from_version = std::mem::replace(&mut self.version, new_version.to_string());
        self.version_history.push(VersionHistoryEntry {
            from_version: from_version.clone(),
            to_version: new_version.to_string(),
            update_date: now,
        });
        self.previous_version = Some(from_version);
        self.last_updated = now;
        self.update_count += 1;
    }
}
