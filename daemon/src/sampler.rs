//! Attributes interface traffic to processes in proportion to their live sockets
//!
//! The kernel only reports aggregate interface counters and, separately, which
//! process owns which socket. Each tick the system-wide byte delta is split
//! across processes by socket weight: established TCP sessions weigh the most,
//! other TCP states and UDP endpoints less but never zero.

use crate::batcher::{PendingRecord, WriteBatcher};
use crate::collector::{ByteCounters, Connection, CounterSource, Endpoint, ProcessIdentity};
use crate::config::AttributionConfig;
use crate::db::UsageRecord;
use crate::stats::{ProcessUsage, StatStore};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub established: f64,
    pub other_tcp: f64,
    pub udp: f64,
}

impl Weights {
    pub fn of(&self, endpoint: Endpoint) -> f64 {
        match endpoint {
            Endpoint::Tcp(state) if state.is_established() => self.established,
            Endpoint::Tcp(_) => self.other_tcp,
            Endpoint::Udp => self.udp,
        }
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self { established: 10.0, other_tcp: 1.0, udp: 0.5 }
    }
}

impl From<&AttributionConfig> for Weights {
    fn from(config: &AttributionConfig) -> Self {
        Self {
            established: config.established_weight,
            other_tcp: config.other_tcp_weight,
            udp: config.udp_weight,
        }
    }
}

/// Accumulated weight per owning pid. Recomputed from scratch every tick, so a
/// pid with no sockets right now gets nothing.
pub fn weigh(connections: &[Connection], weights: &Weights) -> HashMap<u32, f64> {
    let mut by_pid = HashMap::new();
    for conn in connections {
        *by_pid.entry(conn.pid).or_insert(0.0) += weights.of(conn.endpoint);
    }
    by_pid
}

/// Bytes attributed to one process name in one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub name: String,
    /// Pid with the largest weight under this name.
    pub pid: u32,
    pub executable_path: Option<String>,
    pub delta: ByteCounters,
}

/// Split `delta` across pids by weight.
///
/// Unresolvable pids are left out, but their weight still counts toward the
/// total, so their share is simply not attributed. Each resolved pid gets
/// `floor(D * w / W)` except the lightest one, which takes whatever is left of
/// the resolved portion; with every pid resolved the shares sum to exactly `D`.
/// `resolve` is called at most once per pid.
pub fn apportion<F>(delta: ByteCounters, pid_weights: &HashMap<u32, f64>, mut resolve: F) -> Vec<Share>
where
    F: FnMut(u32) -> Option<ProcessIdentity>,
{
    let total: f64 = pid_weights.values().sum();
    if total <= 0.0 {
        return Vec::new();
    }

    let mut resolved: Vec<(u32, f64, ProcessIdentity)> = pid_weights
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .filter_map(|(&pid, &w)| resolve(pid).map(|identity| (pid, w, identity)))
        .collect();
    if resolved.is_empty() {
        return Vec::new();
    }
    resolved.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let all_resolved = resolved.len() == pid_weights.values().filter(|&&w| w > 0.0).count();
    let resolved_weight: f64 = resolved.iter().map(|(_, w, _)| w).sum();
    let portion = |bytes: u64, weight: f64| -> u64 {
        ((bytes as f64 * weight / total).floor() as u64).min(bytes)
    };
    let budget = if all_resolved {
        delta
    } else {
        ByteCounters::new(
            portion(delta.upload, resolved_weight),
            portion(delta.download, resolved_weight),
        )
    };

    let last = resolved.len() - 1;
    let mut given = ByteCounters::default();
    let mut shares: Vec<Share> = Vec::with_capacity(resolved.len());
    let mut index_by_name: HashMap<String, usize> = HashMap::new();

    for (i, (pid, weight, identity)) in resolved.into_iter().enumerate() {
        let part = if i == last {
            ByteCounters::new(
                budget.upload.saturating_sub(given.upload),
                budget.download.saturating_sub(given.download),
            )
        } else {
            ByteCounters::new(portion(delta.upload, weight), portion(delta.download, weight))
        };
        given.upload += part.upload;
        given.download += part.download;

        // Several pids can share one executable name; their bytes are summed.
        match index_by_name.get(&identity.name) {
            Some(&idx) => {
                let share = &mut shares[idx];
                share.delta.upload += part.upload;
                share.delta.download += part.download;
                if share.executable_path.is_none() {
                    share.executable_path = identity.executable_path;
                }
            }
            None => {
                index_by_name.insert(identity.name.clone(), shares.len());
                shares.push(Share {
                    name: identity.name,
                    pid,
                    executable_path: identity.executable_path,
                    delta: part,
                });
            }
        }
    }
    shares
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub delta: ByteCounters,
    /// Process names that received bytes this tick.
    pub attributed: usize,
    /// Entries left in the stat table after the inactivity sweep.
    pub active: usize,
}

pub struct Sampler {
    source: Arc<dyn CounterSource>,
    stats: Arc<StatStore>,
    batcher: Arc<WriteBatcher>,
    weights: Weights,
    inactivity_timeout: chrono::Duration,
    record_ttl: chrono::Duration,
    /// Last counters and the source generation they belong to.
    previous: Option<(u64, ByteCounters)>,
}

impl Sampler {
    pub fn new(
        source: Arc<dyn CounterSource>,
        stats: Arc<StatStore>,
        batcher: Arc<WriteBatcher>,
        weights: Weights,
    ) -> Self {
        Self {
            source,
            stats,
            batcher,
            weights,
            inactivity_timeout: to_chrono(DEFAULT_INACTIVITY_TIMEOUT),
            record_ttl: to_chrono(DEFAULT_RECORD_TTL),
            previous: None,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = to_chrono(timeout);
        self
    }

    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = to_chrono(ttl);
        self
    }

    pub fn tick(&mut self) -> anyhow::Result<TickSummary> {
        self.tick_at(Utc::now())
    }

    /// One sampling tick. On a source error nothing is updated.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> anyhow::Result<TickSummary> {
        let snapshot = self.source.sample()?;

        // First sample, or first after a baseline change, only establishes the baseline.
        let delta = match self.previous.replace((snapshot.generation, snapshot.counters)) {
            Some((generation, previous)) if generation == snapshot.generation => {
                snapshot.counters.delta_since(&previous)
            }
            Some(_) => {
                debug!("Counter baseline changed, skipping attribution for this tick");
                ByteCounters::default()
            }
            None => ByteCounters::default(),
        };

        let shares = if delta.is_zero() {
            Vec::new()
        } else {
            let pid_weights = weigh(&snapshot.connections, &self.weights);
            let source = &self.source;
            apportion(delta, &pid_weights, |pid| source.resolve(pid))
        };

        let timestamp = now.timestamp();
        let expires_at = now
            .checked_add_signed(self.record_ttl)
            .map(|t| t.timestamp())
            .unwrap_or(i64::MAX);
        let mut records = Vec::new();
        let mut touched = HashSet::new();

        let active = {
            let mut table = self.stats.write();

            for share in shares {
                if share.delta.is_zero() {
                    continue;
                }
                let usage = table
                    .entries
                    .entry(share.name.clone())
                    .or_insert_with(|| ProcessUsage::new(share.name.clone(), share.pid));

                let elapsed = usage
                    .last_update
                    .map(|last| (now - last).num_milliseconds() as f64 / 1000.0)
                    .filter(|secs| *secs > 0.0)
                    .unwrap_or(1.0);

                usage.pid = share.pid;
                usage.upload_speed = (share.delta.upload as f64 / elapsed) as u64;
                usage.download_speed = (share.delta.download as f64 / elapsed) as u64;
                usage.total_upload = usage.total_upload.saturating_add(share.delta.upload);
                usage.total_download = usage.total_download.saturating_add(share.delta.download);
                usage.last_update = Some(now);

                records.push(PendingRecord {
                    usage: UsageRecord {
                        app_name: share.name.clone(),
                        process_id: share.pid,
                        upload_bytes: clamp_i64(share.delta.upload),
                        download_bytes: clamp_i64(share.delta.download),
                        timestamp,
                        is_temporary: false,
                        expires_at,
                    },
                    executable_path: share.executable_path,
                });
                touched.insert(share.name);
            }

            for (name, usage) in table.entries.iter_mut() {
                if !touched.contains(name) {
                    usage.upload_speed = 0;
                    usage.download_speed = 0;
                }
            }

            let timeout = self.inactivity_timeout;
            table.entries.retain(|_, usage| match usage.last_update {
                Some(last) => now - last <= timeout,
                None => false,
            });
            table.last_update = Some(now);
            table.entries.len()
        };

        let attributed = records.len();
        self.batcher.push_all(records);

        Ok(TickSummary { delta, attributed, active })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
