//! Integration tests for the monitor lifecycle

mod common;

use common::ScriptedSource;
use netusage_daemon::batcher::FlushOutcome;
use netusage_daemon::collector::{Connection, TcpState};
use netusage_daemon::db::{Database, UsageRecord};
use netusage_daemon::error::MonitorError;
use netusage_daemon::monitor::{Monitor, MonitorOptions, MonitorState};
use netusage_daemon::retention::RetentionPolicy;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options() -> MonitorOptions {
    MonitorOptions {
        sample_interval: Duration::from_millis(20),
        flush_interval: Duration::from_secs(3600),
        ..MonitorOptions::default()
    }
}

fn monitor_with(source: Arc<ScriptedSource>) -> (TempDir, Monitor) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("usage.db")).unwrap();
    (dir, Monitor::new(source, db, options()))
}

fn busy_browser() -> Arc<ScriptedSource> {
    let source = Arc::new(ScriptedSource::new());
    let conns = vec![Connection::tcp(100, TcpState::Established)];
    source.name(100, "firefox");
    source.push(0, 0, conns.clone());
    source.push(1000, 3000, conns);
    source
}

fn raw(app: &str, timestamp: i64) -> UsageRecord {
    UsageRecord {
        app_name: app.to_string(),
        process_id: 1,
        upload_bytes: 10,
        download_bytes: 10,
        timestamp,
        is_temporary: false,
        expires_at: timestamp + 86_400,
    }
}

#[tokio::test]
async fn test_start_samples_and_stop_flushes() {
    let (_dir, monitor) = monitor_with(busy_browser());
    monitor.start().await.unwrap();

    let stats = monitor.current_stats();
    assert_eq!(stats["firefox"].total_upload, 1000);
    assert_eq!(stats["firefox"].total_download, 3000);
    assert_eq!(monitor.storage_stats().await.unwrap().record_count, 0);

    let outcome = monitor.stop().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Written { records: 1, upload: 1000, download: 3000 });
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(monitor.storage_stats().await.unwrap().record_count, 1);

    let today = monitor.today_totals().await.unwrap();
    assert_eq!((today.total_upload, today.total_download), (1000, 3000));
    let day = monitor.last_24_hour_totals().await.unwrap();
    assert_eq!(day.upload, 1000);
    let apps = monitor.app_usage_for_retention_window(30).await.unwrap();
    assert_eq!(apps[0].app_name, "firefox");
    assert_eq!(monitor.recent_daily_summaries(7).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_status_follows_lifecycle() {
    let (_dir, monitor) = monitor_with(busy_browser());
    assert!(!monitor.status().running);

    monitor.start().await.unwrap();
    let status = monitor.status();
    assert!(status.running);
    assert!(!status.paused);
    assert_eq!(status.update_interval_ms, 20);
    assert!(status.last_update.is_some());

    monitor.pause();
    assert!(monitor.status().paused);
    assert!(monitor.status().running);
    monitor.resume();
    assert!(!monitor.status().paused);

    assert!(matches!(monitor.start().await, Err(MonitorError::AlreadyStarted)));

    monitor.stop().await.unwrap();
    assert!(!monitor.status().running);
    assert!(matches!(monitor.start().await, Err(MonitorError::Stopped)));
    // Second stop is a no-op.
    assert_eq!(monitor.stop().await.unwrap(), FlushOutcome::Empty);
}

#[tokio::test]
async fn test_paused_monitor_does_not_sample() {
    let source = busy_browser();
    let (_dir, monitor) = monitor_with(source.clone());
    monitor.start().await.unwrap();
    monitor.pause();
    tokio::time::sleep(Duration::from_millis(30)).await;

    source.push(5000, 5000, vec![Connection::tcp(100, TcpState::Established)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.current_stats()["firefox"].total_upload, 1000);

    monitor.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.current_stats()["firefox"].total_upload, 5000);
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_propagates_source_error() {
    let source = Arc::new(ScriptedSource::new());
    source.push_error();
    let (_dir, monitor) = monitor_with(source);

    assert!(matches!(monitor.start().await, Err(MonitorError::Source(_))));
    assert_eq!(monitor.state(), MonitorState::Initializing);
}

#[tokio::test]
async fn test_do_not_save_discards_on_stop() {
    let (_dir, monitor) = monitor_with(busy_browser());
    monitor.set_retention(RetentionPolicy::DoNotSave);
    assert!(!monitor.persistence_enabled());

    monitor.start().await.unwrap();
    assert!(!monitor.current_stats().is_empty());

    let outcome = monitor.stop().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Discarded(1));
    assert_eq!(monitor.storage_stats().await.unwrap().record_count, 0);
}

#[tokio::test]
async fn test_one_minute_retention_keeps_only_recent_records() {
    let (_dir, monitor) = monitor_with(busy_browser());
    let now = chrono::Utc::now().timestamp();
    {
        let db = monitor.database();
        let mut db = db.lock().await;
        db.insert_batch(&[raw("old", now - 120), raw("older", now - 3600), raw("new", now - 10)])
            .unwrap();
    }

    let report = monitor.apply_retention_now(RetentionPolicy::OneMinute).await.unwrap();
    assert_eq!(report.aged_out, 2);
    assert!(report.vacuumed);

    let db = monitor.database();
    let remaining = db.lock().await.usage_by_range(0, i64::MAX).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].app_name, "new");
}

#[tokio::test]
async fn test_clear_all_wipes_history() {
    let (_dir, monitor) = monitor_with(busy_browser());
    let now = chrono::Utc::now().timestamp();
    {
        let db = monitor.database();
        let mut db = db.lock().await;
        db.insert_batch(&[raw("a", now)]).unwrap();
        db.update_daily_summary("2024-01-01", 1, 1).unwrap();
    }

    monitor.clear_all().await.unwrap();
    assert_eq!(monitor.storage_stats().await.unwrap().record_count, 0);
    assert!(monitor.recent_daily_summaries(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_changing_retention_prunes_immediately() {
    let (_dir, monitor) = monitor_with(busy_browser());
    let now = chrono::Utc::now().timestamp();
    {
        let db = monitor.database();
        let mut db = db.lock().await;
        let old = UsageRecord { expires_at: now + 86_400, ..raw("old", now - 3 * 86_400) };
        db.insert_batch(&[old, raw("new", now - 60)]).unwrap();
    }

    let report = monitor.change_retention(RetentionPolicy::Days(1)).await.unwrap();
    assert_eq!(report.aged_out, 1);
    assert_eq!(monitor.retention(), RetentionPolicy::Days(1));
    assert!(monitor.persistence_enabled());

    let apps = monitor.app_usage_for_retention_window(0).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].app_name, "new");

    monitor.change_retention(RetentionPolicy::DoNotSave).await.unwrap();
    assert!(!monitor.persistence_enabled());
}

#[tokio::test]
async fn test_stop_during_startup_keeps_second_sample() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("usage.db")).unwrap();
    let options = MonitorOptions {
        sample_interval: Duration::from_millis(200),
        ..options()
    };
    let monitor = Arc::new(Monitor::new(busy_browser(), db, options));

    let starting = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        async move { monitor.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.stop().await.unwrap(), FlushOutcome::Empty);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(MonitorError::Stopped)));
    assert_eq!(monitor.state(), MonitorState::Stopped);

    let today = monitor.today_totals().await.unwrap();
    assert_eq!((today.total_upload, today.total_download), (1000, 3000));
    assert_eq!(monitor.storage_stats().await.unwrap().record_count, 1);
}
