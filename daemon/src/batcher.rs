//! Buffers per-tick usage records and writes them on the slower flush cadence

use crate::db::{date_key, AppMetadata, Database, UsageRecord};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info};

/// A usage record plus what the sampler knew about the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub usage: UsageRecord,
    pub executable_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushOutcome {
    Empty,
    /// Persistence was disabled; the buffered records were dropped.
    Discarded(usize),
    Written { records: usize, upload: i64, download: i64 },
}

enum Drained {
    Batch(Vec<PendingRecord>),
    Skipped(FlushOutcome),
}

/// The pending buffer has its own lock so slow flushes never block the
/// sampler or stat readers.
pub struct WriteBatcher {
    pending: Mutex<Vec<PendingRecord>>,
    persist: RwLock<bool>,
}

impl WriteBatcher {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            persist: RwLock::new(true),
        }
    }

    pub fn push_all(&self, records: Vec<PendingRecord>) {
        if records.is_empty() {
            return;
        }
        self.pending.lock().extend(records);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn set_persistence_enabled(&self, enabled: bool) {
        *self.persist.write() = enabled;
        if enabled {
            info!("Data saving enabled");
        } else {
            info!("Data saving disabled - data will not be stored");
        }
    }

    pub fn persistence_enabled(&self) -> bool {
        *self.persist.read()
    }

    /// Swap the buffer for an empty one; sampling keeps appending to the new buffer.
    fn drain(&self) -> Drained {
        let batch = std::mem::take(&mut *self.pending.lock());
        if !self.persistence_enabled() {
            if !batch.is_empty() {
                debug!("Discarding {} buffered records, persistence disabled", batch.len());
            }
            return Drained::Skipped(FlushOutcome::Discarded(batch.len()));
        }
        if batch.is_empty() {
            return Drained::Skipped(FlushOutcome::Empty);
        }
        Drained::Batch(batch)
    }

    pub fn flush(&self, db: &mut Database, now: i64) -> Result<FlushOutcome> {
        match self.drain() {
            Drained::Batch(batch) => write_batch(db, batch, now),
            Drained::Skipped(outcome) => Ok(outcome),
        }
    }

    /// Drain before waiting on the database lock so the buffer is released immediately.
    pub async fn flush_to(&self, db: &tokio::sync::Mutex<Database>) -> Result<FlushOutcome> {
        match self.drain() {
            Drained::Batch(batch) => {
                let mut db = db.lock().await;
                write_batch(&mut db, batch, chrono::Utc::now().timestamp())
            }
            Drained::Skipped(outcome) => Ok(outcome),
        }
    }
}

impl Default for WriteBatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// One transactional insert, then metadata and daily rollup. A failed insert
/// drops the batch; it is not re-queued.
fn write_batch(db: &mut Database, batch: Vec<PendingRecord>, now: i64) -> Result<FlushOutcome> {
    let mut upload = 0i64;
    let mut download = 0i64;
    let mut metadata: HashMap<String, AppMetadata> = HashMap::new();
    let mut records = Vec::with_capacity(batch.len());

    for pending in batch {
        let usage = pending.usage;
        upload += usage.upload_bytes;
        download += usage.download_bytes;

        let entry = metadata.entry(usage.app_name.clone()).or_insert_with(|| AppMetadata {
            app_name: usage.app_name.clone(),
            executable_path: usage.app_name.clone(),
            first_seen: usage.timestamp,
            last_seen: now,
        });
        entry.first_seen = entry.first_seen.min(usage.timestamp);
        if let Some(path) = pending.executable_path {
            entry.executable_path = path;
        }
        records.push(usage);
    }

    let written = db.insert_batch(&records)?;

    for meta in metadata.values() {
        if let Err(e) = db.upsert_app_metadata(meta) {
            error!("Failed to update app metadata for {}: {}", meta.app_name, e);
        }
    }

    if let Err(e) = db.update_daily_summary(&date_key(now), upload, download) {
        error!("Failed to update daily summary: {}", e);
    }

    info!(
        "Flushed {} records ({} up, {} down)",
        written,
        format_bytes(upload),
        format_bytes(download)
    );
    Ok(FlushOutcome::Written { records: written, upload, download })
}

pub fn format_bytes(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
