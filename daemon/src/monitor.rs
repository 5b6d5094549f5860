//! Monitor lifecycle: the sampling loop, the flush loop and the retention loops

use crate::batcher::{FlushOutcome, WriteBatcher};
use crate::collector::CounterSource;
use crate::config::Config;
use crate::db::{date_key, AppUsageStat, DailySummary, Database, StorageStats, UsageTotals};
use crate::error::{MonitorError, Result as StoreResult};
use crate::retention::{self, RetentionPass, RetentionPolicy, RetentionReport};
use crate::sampler::{Sampler, Weights, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_RECORD_TTL};
use crate::stats::{ProcessUsage, StatStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type SharedDatabase = Arc<tokio::sync::Mutex<Database>>;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub sample_interval: Duration,
    pub flush_interval: Duration,
    pub inactivity_timeout: Duration,
    pub record_ttl: Duration,
    pub weights: Weights,
    pub expiry_interval: Duration,
    pub sweep_interval: Duration,
    pub maintenance_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
            flush_interval: Duration::from_secs(10),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            record_ttl: DEFAULT_RECORD_TTL,
            weights: Weights::default(),
            expiry_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl MonitorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_interval: config.general.sample_interval(),
            flush_interval: config.general.flush_interval(),
            inactivity_timeout: config.general.inactivity_timeout(),
            record_ttl: config.storage.record_ttl(),
            weights: Weights::from(&config.attribution),
            expiry_interval: Duration::from_secs(config.retention.expiry_interval_secs.max(1)),
            sweep_interval: Duration::from_secs(config.retention.sweep_interval_secs.max(1)),
            maintenance_interval: Duration::from_secs(
                config.retention.maintenance_interval_secs.max(1),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Initializing,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub paused: bool,
    pub update_interval_ms: u64,
    pub last_update: Option<DateTime<Utc>>,
}

pub struct Monitor {
    options: MonitorOptions,
    source: Arc<dyn CounterSource>,
    db: SharedDatabase,
    stats: Arc<StatStore>,
    batcher: Arc<WriteBatcher>,
    state: Arc<RwLock<MonitorState>>,
    retention: Arc<RwLock<RetentionPolicy>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(source: Arc<dyn CounterSource>, db: Database, options: MonitorOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            options,
            source,
            db: Arc::new(tokio::sync::Mutex::new(db)),
            stats: Arc::new(StatStore::new()),
            batcher: Arc::new(WriteBatcher::new()),
            state: Arc::new(RwLock::new(MonitorState::Initializing)),
            retention: Arc::new(RwLock::new(RetentionPolicy::default())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn database(&self) -> SharedDatabase {
        Arc::clone(&self.db)
    }

    pub fn state(&self) -> MonitorState {
        *self.state.read()
    }

    /// Take two samples one interval apart so the first published speeds have
    /// a real baseline, then spawn the background loops.
    pub async fn start(&self) -> Result<(), MonitorError> {
        match self.state() {
            MonitorState::Initializing => {}
            MonitorState::Stopped => return Err(MonitorError::Stopped),
            MonitorState::Running | MonitorState::Paused => return Err(MonitorError::AlreadyStarted),
        }

        info!("Initializing network monitor...");
        let mut sampler = Sampler::new(
            Arc::clone(&self.source),
            Arc::clone(&self.stats),
            Arc::clone(&self.batcher),
            self.options.weights,
        )
        .with_inactivity_timeout(self.options.inactivity_timeout)
        .with_record_ttl(self.options.record_ttl);

        sampler.tick()?;
        tokio::time::sleep(self.options.sample_interval).await;
        sampler.tick()?;

        let stopped = {
            let mut state = self.state.write();
            let stopped = *state != MonitorState::Initializing;
            if !stopped {
                *state = MonitorState::Running;
            }
            stopped
        };
        if stopped {
            // stop() already flushed; the second tick may have buffered more since.
            let outcome = self.batcher.flush_to(&self.db).await?;
            debug!("Stopped during initialization, flushed {:?}", outcome);
            return Err(MonitorError::Stopped);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(sampling_loop(
            sampler,
            Arc::clone(&self.state),
            self.options.sample_interval,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(flush_loop(
            Arc::clone(&self.batcher),
            Arc::clone(&self.db),
            self.options.flush_interval,
            self.shutdown.subscribe(),
        )));
        let schedules = [
            ("expiry", RetentionPass::EXPIRY, self.options.expiry_interval, true),
            ("sweep", RetentionPass::SWEEP, self.options.sweep_interval, false),
            ("maintenance", RetentionPass::FULL, self.options.maintenance_interval, false),
        ];
        for (name, pass, period, immediate) in schedules {
            tasks.push(tokio::spawn(retention_loop(
                name,
                pass,
                period,
                immediate,
                Arc::clone(&self.db),
                Arc::clone(&self.retention),
                self.shutdown.subscribe(),
            )));
        }

        info!("Network monitor started");
        Ok(())
    }

    /// Takes effect at the next tick boundary.
    pub fn pause(&self) {
        let mut state = self.state.write();
        if *state == MonitorState::Running {
            *state = MonitorState::Paused;
            info!("Monitoring paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == MonitorState::Paused {
            *state = MonitorState::Running;
            info!("Monitoring resumed");
        }
    }

    /// Stop every loop, then flush whatever the sampler buffered.
    pub async fn stop(&self) -> Result<FlushOutcome, MonitorError> {
        let previous = std::mem::replace(&mut *self.state.write(), MonitorState::Stopped);
        if previous == MonitorState::Stopped {
            return Ok(FlushOutcome::Empty);
        }

        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let outcome = self.batcher.flush_to(&self.db).await?;
        info!("Network monitor stopped");
        Ok(outcome)
    }

    pub fn set_persistence_enabled(&self, enabled: bool) {
        self.batcher.set_persistence_enabled(enabled);
    }

    pub fn persistence_enabled(&self) -> bool {
        self.batcher.persistence_enabled()
    }

    /// Policy read by the retention loops. `DoNotSave` also turns persistence off.
    pub fn set_retention(&self, policy: RetentionPolicy) {
        let previous = std::mem::replace(&mut *self.retention.write(), policy);
        if previous != policy {
            info!("Data retention changed from {} to {}", previous, policy);
        }
        self.batcher.set_persistence_enabled(policy.persists());
    }

    pub fn retention(&self) -> RetentionPolicy {
        *self.retention.read()
    }

    /// Switch to `policy` and enforce it immediately instead of waiting for
    /// the next sweep.
    pub async fn change_retention(
        &self,
        policy: RetentionPolicy,
    ) -> Result<RetentionReport, MonitorError> {
        self.set_retention(policy);
        self.apply_retention_now(policy).await
    }

    /// Expire, apply the age cutoff for `policy`, and reclaim space.
    pub async fn apply_retention_now(
        &self,
        policy: RetentionPolicy,
    ) -> Result<RetentionReport, MonitorError> {
        info!("Applying retention now: {}", policy);
        let db = self.db.lock().await;
        let report = retention::run(&db, policy, RetentionPass::FULL, Utc::now().timestamp())?;
        Ok(report)
    }

    pub fn current_stats(&self) -> HashMap<String, ProcessUsage> {
        self.stats.snapshot()
    }

    pub fn total_speed(&self) -> (u64, u64) {
        self.stats.total_speed()
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state();
        MonitorStatus {
            running: matches!(state, MonitorState::Running | MonitorState::Paused),
            paused: state == MonitorState::Paused,
            update_interval_ms: self.options.sample_interval.as_millis() as u64,
            last_update: self.stats.last_update(),
        }
    }

    pub async fn daily_totals(&self, date: &str) -> StoreResult<DailySummary> {
        self.db.lock().await.daily_summary(date)
    }

    pub async fn today_totals(&self) -> StoreResult<DailySummary> {
        self.daily_totals(&date_key(Utc::now().timestamp())).await
    }

    pub async fn last_24_hour_totals(&self) -> StoreResult<UsageTotals> {
        self.db.lock().await.last_24h_usage()
    }

    pub async fn app_usage_for_retention_window(&self, days: i64) -> StoreResult<Vec<AppUsageStat>> {
        self.db.lock().await.app_usage_for_retention(days)
    }

    pub async fn recent_daily_summaries(&self, limit: u32) -> StoreResult<Vec<DailySummary>> {
        self.db.lock().await.recent_summaries(limit)
    }

    pub async fn storage_stats(&self) -> StoreResult<StorageStats> {
        self.db.lock().await.storage_stats()
    }

    /// Wipe all usage history and compact the file.
    pub async fn clear_all(&self) -> StoreResult<()> {
        let db = self.db.lock().await;
        db.clear_all()?;
        db.vacuum()?;
        info!("Cleared all usage data");
        Ok(())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn ticker(period: Duration, immediate: bool) -> tokio::time::Interval {
    let start = if immediate { Instant::now() } else { Instant::now() + period };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn sampling_loop(
    mut sampler: Sampler,
    state: Arc<RwLock<MonitorState>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period, false);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *state.read() != MonitorState::Running {
                    continue;
                }
                if let Err(e) = sampler.tick() {
                    warn!("Sampling failed, skipping tick: {:#}", e);
                }
            }
        }
    }
    debug!("Sampling loop stopped");
}

async fn flush_loop(
    batcher: Arc<WriteBatcher>,
    db: SharedDatabase,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period, false);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = batcher.flush_to(&db).await {
                    error!("Failed to flush usage records: {}", e);
                }
            }
        }
    }
    debug!("Flush loop stopped");
}

async fn retention_loop(
    name: &'static str,
    pass: RetentionPass,
    period: Duration,
    immediate: bool,
    db: SharedDatabase,
    policy: Arc<RwLock<RetentionPolicy>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period, immediate);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let current = *policy.read();
                let db = db.lock().await;
                match retention::run(&db, current, pass, Utc::now().timestamp()) {
                    Ok(report) => debug!(
                        "Retention {} ({}): {} expired, {} aged out",
                        name, current, report.expired, report.aged_out
                    ),
                    Err(e) => error!("Retention {} failed: {}", name, e),
                }
            }
        }
    }
    debug!("Retention {} loop stopped", name);
}
