//! Live per-process usage, keyed by executable name

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub name: String,
    /// Last pid seen under this name; may be stale once the process exits.
    pub pid: u32,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub total_upload: u64,
    pub total_download: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl ProcessUsage {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
            upload_speed: 0,
            download_speed: 0,
            total_upload: 0,
            total_download: 0,
            last_update: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatTable {
    pub entries: HashMap<String, ProcessUsage>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Readers take the shared lock; the sampler holds the exclusive lock for the
/// in-memory part of one tick only.
#[derive(Debug, Default)]
pub struct StatStore {
    table: RwLock<StatTable>,
}

impl StatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StatTable> {
        self.table.write()
    }

    pub fn snapshot(&self) -> HashMap<String, ProcessUsage> {
        self.table.read().entries.clone()
    }

    pub fn get(&self, name: &str) -> Option<ProcessUsage> {
        self.table.read().entries.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.table.read().last_update
    }

    /// Sum of instantaneous speeds across all live entries.
    pub fn total_speed(&self) -> (u64, u64) {
        let table = self.table.read();
        table.entries.values().fold((0, 0), |(up, down), usage| {
            (up + usage.upload_speed, down + usage.download_speed)
        })
    }
}
