//! SQLite usage history: raw records, daily rollups, app metadata and settings

use crate::error::{Result, StoreError};
use crate::settings::SettingsStore;
use chrono::{Local, TimeZone};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

const INSERT_USAGE: &str = "INSERT INTO usage_records
    (app_name, process_id, upload_bytes, download_bytes, timestamp, is_temporary, expires_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const INSERT_ATTEMPTS: u32 = 5;
const INSERT_BACKOFF_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub app_name: String,
    pub process_id: u32,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub timestamp: i64,
    pub is_temporary: bool,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub total_upload: i64,
    pub total_download: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppMetadata {
    pub app_name: String,
    pub executable_path: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppUsageStat {
    pub app_name: String,
    pub total_upload: i64,
    pub total_download: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub size_bytes: u64,
    pub record_count: i64,
    pub oldest_record_timestamp: Option<i64>,
}

/// Guards against unbounded growth on large batch inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    /// Batches larger than this trigger the size and free-space checks.
    pub large_batch_threshold: usize,
    pub max_database_bytes: u64,
    pub min_free_bytes: u64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            large_batch_threshold: 100,
            max_database_bytes: 10 * 1024 * 1024 * 1024,
            min_free_bytes: 100 * 1024 * 1024,
        }
    }
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
    limits: StorageLimits,
    quarantined: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the store, quarantining a file that fails the
    /// integrity check and starting fresh in its place.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let quarantined = if path.exists() {
            match check_integrity(path) {
                Ok(()) => None,
                Err(reason) => quarantine(path, &reason),
            }
        } else {
            None
        };

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "cache_size", -64000)?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
            limits: StorageLimits::default(),
            quarantined,
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(&Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "netusage")
            .map(|dirs| dirs.data_dir().join("netusage.db"))
            .unwrap_or_else(|| PathBuf::from("netusage.db"))
    }

    /// How long SQLite itself waits on a locked database before reporting busy.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    pub fn with_limits(mut self, limits: StorageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a corrupted predecessor was moved to, if this open recovered from one.
    pub fn quarantined(&self) -> Option<&Path> {
        self.quarantined.as_deref()
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))?;
        self.migrate_schema()?;
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_usage_expires ON usage_records(expires_at);
             CREATE INDEX IF NOT EXISTS idx_usage_temporary ON usage_records(is_temporary);",
        )?;
        Ok(())
    }

    /// Additive only: columns introduced after the first release are added in place.
    fn migrate_schema(&self) -> Result<()> {
        let columns: HashSet<String> = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(usage_records)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if !columns.contains("expires_at") {
            self.conn
                .execute("ALTER TABLE usage_records ADD COLUMN expires_at INTEGER", [])?;
            info!("Database migrated: added expires_at column");
        }
        if !columns.contains("is_temporary") {
            self.conn.execute(
                "ALTER TABLE usage_records ADD COLUMN is_temporary INTEGER DEFAULT 0",
                [],
            )?;
            info!("Database migrated: added is_temporary column");
        }
        Ok(())
    }

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    /// Single-row insert, retried with exponential backoff while the database is busy.
    pub fn insert_record(&self, record: &UsageRecord) -> Result<()> {
        retry_while_busy(|| {
            self.conn.execute(
                INSERT_USAGE,
                params![
                    record.app_name,
                    record.process_id,
                    record.upload_bytes,
                    record.download_bytes,
                    record.timestamp,
                    record.is_temporary,
                    record.expires_at
                ],
            )
        })?;
        Ok(())
    }

    /// All-or-nothing insert of one flush worth of records.
    pub fn insert_batch(&mut self, records: &[UsageRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        if records.len() > self.limits.large_batch_threshold {
            self.check_capacity()?;
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_USAGE)?;
            for record in records {
                stmt.execute(params![
                    record.app_name,
                    record.process_id,
                    record.upload_bytes,
                    record.download_bytes,
                    record.timestamp,
                    record.is_temporary,
                    record.expires_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn check_capacity(&self) -> Result<()> {
        if let Ok(size) = self.size_bytes() {
            if size > self.limits.max_database_bytes {
                return Err(StoreError::SizeLimit {
                    size,
                    limit: self.limits.max_database_bytes,
                });
            }
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        match available_space(dir) {
            Ok(available) if available < self.limits.min_free_bytes => {
                Err(StoreError::InsufficientSpace {
                    available,
                    required: self.limits.min_free_bytes,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Could not check disk space for {}: {}", dir.display(), e);
                Ok(())
            }
        }
    }

    /// Add to the totals for `date`; never overwrites.
    pub fn update_daily_summary(&self, date: &str, upload: i64, download: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO daily_summaries (date, total_upload, total_download) VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET
                total_upload = total_upload + excluded.total_upload,
                total_download = total_download + excluded.total_download",
            params![date, upload, download],
        )?;
        Ok(())
    }

    pub fn upsert_app_metadata(&self, metadata: &AppMetadata) -> Result<()> {
        self.conn.execute(
            "INSERT INTO app_metadata (app_name, executable_path, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_name) DO UPDATE SET
                executable_path = CASE
                    WHEN excluded.executable_path = app_metadata.app_name
                        THEN app_metadata.executable_path
                    ELSE excluded.executable_path
                END,
                last_seen = MAX(app_metadata.last_seen, excluded.last_seen)",
            params![
                metadata.app_name,
                metadata.executable_path,
                metadata.first_seen,
                metadata.last_seen
            ],
        )?;
        Ok(())
    }

    /// Zero-valued summary when nothing was recorded for `date`.
    pub fn daily_summary(&self, date: &str) -> Result<DailySummary> {
        let summary = self
            .conn
            .query_row(
                "SELECT date, total_upload, total_download FROM daily_summaries WHERE date = ?1",
                params![date],
                map_summary,
            )
            .optional()?;
        Ok(summary.unwrap_or_else(|| DailySummary {
            date: date.to_string(),
            total_upload: 0,
            total_download: 0,
        }))
    }

    pub fn recent_summaries(&self, limit: u32) -> Result<Vec<DailySummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, total_upload, total_download FROM daily_summaries
             ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], map_summary)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn app_metadata(&self, app_name: &str) -> Result<Option<AppMetadata>> {
        let metadata = self
            .conn
            .query_row(
                "SELECT app_name, executable_path, first_seen, last_seen
                 FROM app_metadata WHERE app_name = ?1",
                params![app_name],
                |row| {
                    Ok(AppMetadata {
                        app_name: row.get(0)?,
                        executable_path: row.get(1)?,
                        first_seen: row.get(2)?,
                        last_seen: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    /// Per-app totals between two unix timestamps, heaviest first.
    pub fn app_usage_stats(&self, start: i64, end: i64) -> Result<Vec<AppUsageStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT app_name, SUM(upload_bytes) AS total_upload, SUM(download_bytes) AS total_download,
                    MAX(timestamp) AS last_seen
             FROM usage_records
             WHERE timestamp BETWEEN ?1 AND ?2
             GROUP BY app_name
             ORDER BY (total_upload + total_download) DESC",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(AppUsageStat {
                app_name: row.get(0)?,
                total_upload: row.get(1)?,
                total_download: row.get(2)?,
                last_seen: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// `days <= 0` covers all stored history.
    pub fn app_usage_for_retention(&self, days: i64) -> Result<Vec<AppUsageStat>> {
        let now = Self::now();
        let start = if days <= 0 { 0 } else { now - days * 86_400 };
        self.app_usage_stats(start, now)
    }

    pub fn last_24h_usage(&self) -> Result<UsageTotals> {
        let since = Self::now() - 86_400;
        let totals = self.conn.query_row(
            "SELECT COALESCE(SUM(upload_bytes), 0), COALESCE(SUM(download_bytes), 0)
             FROM usage_records WHERE timestamp >= ?1",
            params![since],
            |row| Ok(UsageTotals { upload: row.get(0)?, download: row.get(1)? }),
        )?;
        Ok(totals)
    }

    pub fn usage_by_range(&self, start: i64, end: i64) -> Result<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT app_name, process_id, upload_bytes, download_bytes, timestamp,
                    COALESCE(is_temporary, 0), COALESCE(expires_at, 0)
             FROM usage_records
             WHERE timestamp BETWEEN ?1 AND ?2
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(UsageRecord {
                app_name: row.get(0)?,
                process_id: row.get(1)?,
                upload_bytes: row.get(2)?,
                download_bytes: row.get(3)?,
                timestamp: row.get(4)?,
                is_temporary: row.get::<_, i64>(5)? != 0,
                expires_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Remove raw records past their `expires_at`. Rows without an expiry
    /// (pre-migration data) are left to the age-based sweep.
    pub fn delete_expired(&self) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM usage_records WHERE expires_at > 0 AND expires_at < ?1",
            params![Self::now()],
        )?;
        if deleted > 0 {
            info!("Deleted {} expired records", deleted);
        }
        Ok(deleted)
    }

    pub fn delete_temporary(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM usage_records WHERE is_temporary = 1", [])?)
    }

    /// Remove raw records and daily summaries strictly before `cutoff`.
    pub fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM usage_records WHERE timestamp < ?1 AND COALESCE(is_temporary, 0) = 0",
            params![cutoff],
        )?;
        self.conn.execute(
            "DELETE FROM daily_summaries WHERE date < ?1",
            params![date_key(cutoff)],
        )?;
        Ok(deleted)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM usage_records;
             DELETE FROM daily_summaries;",
        )?;
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Main file plus the write-ahead log, which holds pages not yet checkpointed.
    pub fn size_bytes(&self) -> Result<u64> {
        let main = std::fs::metadata(&self.path)?.len();
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        let wal = std::fs::metadata(&wal).map(|meta| meta.len()).unwrap_or(0);
        Ok(main + wal)
    }

    pub fn record_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))?)
    }

    pub fn oldest_record(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MIN(timestamp) FROM usage_records", [], |row| row.get(0))?)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            size_bytes: self.size_bytes()?,
            record_count: self.record_count()?,
            oldest_record_timestamp: self.oldest_record()?,
        })
    }

    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

impl SettingsStore for Database {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Local calendar date of a unix timestamp, as stored in `daily_summaries`.
pub fn date_key(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.format(DATE_FORMAT).to_string(),
        None => Local::now().format(DATE_FORMAT).to_string(),
    }
}

fn map_summary(row: &rusqlite::Row) -> rusqlite::Result<DailySummary> {
    Ok(DailySummary {
        date: row.get(0)?,
        total_upload: row.get(1)?,
        total_download: row.get(2)?,
    })
}

/// Run `op`, backing off 50ms, 100ms, ... while it reports busy. Other errors
/// and the final busy error are returned as is.
fn retry_while_busy<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt + 1 < INSERT_ATTEMPTS => {
                let backoff = INSERT_BACKOFF_BASE * 2u32.pow(attempt);
                debug!("Database busy, retrying in {:?}", backoff);
                std::thread::sleep(backoff);
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

fn check_integrity(path: &Path) -> std::result::Result<(), String> {
    let conn = Connection::open(path).map_err(|e| format!("cannot open database: {}", e))?;
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| format!("integrity check failed: {}", e))?;
    if result == "ok" {
        Ok(())
    } else {
        Err(result)
    }
}

/// Move a corrupted database aside with a timestamp suffix and drop its WAL side files.
fn quarantine(path: &Path, reason: &str) -> Option<PathBuf> {
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".corrupted.{}", Local::now().format("%Y%m%d_%H%M%S")));
    let backup = PathBuf::from(backup);

    warn!("Database corruption detected ({}), moving it to {}", reason, backup.display());
    let moved = match std::fs::rename(path, &backup) {
        Ok(()) => Some(backup),
        Err(e) => {
            warn!("Could not back up corrupted database: {}", e);
            None
        }
    };

    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(side));
    }
    moved
}

fn available_space(dir: &Path) -> io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
