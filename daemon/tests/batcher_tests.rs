use netusage_daemon::batcher::{FlushOutcome, PendingRecord, WriteBatcher};
use netusage_daemon::db::{date_key, Database, UsageRecord};
use tempfile::TempDir;

fn pending(app: &str, up: i64, down: i64, timestamp: i64, path: Option<&str>) -> PendingRecord {
    PendingRecord {
        usage: UsageRecord {
            app_name: app.to_string(),
            process_id: 1,
            upload_bytes: up,
            download_bytes: down,
            timestamp,
            is_temporary: false,
            expires_at: timestamp + 86_400,
        },
        executable_path: path.map(str::to_string),
    }
}

fn open_temp() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("usage.db")).unwrap();
    (dir, db)
}

#[test]
fn test_flush_writes_records_metadata_and_summary() {
    let (_dir, mut db) = open_temp();
    let now = chrono::Utc::now().timestamp();
    let batcher = WriteBatcher::new();
    batcher.push_all(vec![
        pending("firefox", 100, 1000, now - 8, Some("/usr/bin/firefox")),
        pending("firefox", 50, 500, now - 9, None),
        pending("curl", 1, 2, now - 1, None),
    ]);

    let outcome = batcher.flush(&mut db, now).unwrap();
    assert_eq!(outcome, FlushOutcome::Written { records: 3, upload: 151, download: 1502 });
    assert_eq!(batcher.pending_len(), 0);
    assert_eq!(db.record_count().unwrap(), 3);

    let meta = db.app_metadata("firefox").unwrap().unwrap();
    assert_eq!(meta.first_seen, now - 9);
    assert_eq!(meta.last_seen, now);
    assert_eq!(meta.executable_path, "/usr/bin/firefox");
    // No resolved path: the name stands in.
    assert_eq!(db.app_metadata("curl").unwrap().unwrap().executable_path, "curl");

    let summary = db.daily_summary(&date_key(now)).unwrap();
    assert_eq!((summary.total_upload, summary.total_download), (151, 1502));
}

#[test]
fn test_summary_accumulates_across_flushes() {
    let (_dir, mut db) = open_temp();
    let now = chrono::Utc::now().timestamp();
    let batcher = WriteBatcher::new();

    batcher.push_all(vec![pending("a", 10, 20, now, None)]);
    batcher.flush(&mut db, now).unwrap();
    batcher.push_all(vec![pending("a", 3, 4, now, None)]);
    batcher.flush(&mut db, now).unwrap();

    let summary = db.daily_summary(&date_key(now)).unwrap();
    assert_eq!((summary.total_upload, summary.total_download), (13, 24));
}

#[test]
fn test_disabled_persistence_discards_buffer() {
    let (_dir, mut db) = open_temp();
    let now = chrono::Utc::now().timestamp();
    let batcher = WriteBatcher::new();
    let before = db.storage_stats().unwrap().record_count;

    batcher.set_persistence_enabled(false);
    batcher.push_all(vec![pending("a", 1, 1, now, None), pending("b", 1, 1, now, None)]);
    assert_eq!(batcher.flush(&mut db, now).unwrap(), FlushOutcome::Discarded(2));
    assert_eq!(batcher.pending_len(), 0);
    assert_eq!(db.storage_stats().unwrap().record_count, before);

    batcher.set_persistence_enabled(true);
    assert_eq!(batcher.flush(&mut db, now).unwrap(), FlushOutcome::Empty);
}

#[test]
fn test_failed_insert_drops_batch() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::open(&dir.path().join("usage.db"))
        .unwrap()
        .with_limits(netusage_daemon::db::StorageLimits {
            large_batch_threshold: 0,
            max_database_bytes: u64::MAX,
            min_free_bytes: u64::MAX,
        });
    let now = chrono::Utc::now().timestamp();
    let batcher = WriteBatcher::new();
    batcher.push_all(vec![pending("a", 1, 1, now, None)]);

    assert!(batcher.flush(&mut db, now).is_err());
    assert_eq!(batcher.pending_len(), 0);
    assert_eq!(db.record_count().unwrap(), 0);
}

#[tokio::test]
async fn test_flush_to_shared_database() {
    let (_dir, db) = open_temp();
    let db = tokio::sync::Mutex::new(db);
    let batcher = WriteBatcher::new();
    batcher.push_all(vec![pending("a", 7, 8, chrono::Utc::now().timestamp(), None)]);

    let outcome = batcher.flush_to(&db).await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Written { records: 1, .. }));
    assert_eq!(db.lock().await.record_count().unwrap(), 1);
}
