//! Retention policy and the sweeps that enforce it

use crate::db::Database;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

const SECONDS_PER_DAY: i64 = 86_400;
const ONE_MINUTE: i64 = 60;

/// Typed view of the numeric `data_retention` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RetentionPolicy {
    /// Keep N days of history (setting value N > 0).
    Days(u32),
    /// Keep roughly one minute (setting value 0); diagnostic mode.
    OneMinute,
    /// No age-based deletion (setting value -1). The 24h raw-record expiry still applies.
    Forever,
    /// Persist nothing (setting value -2).
    DoNotSave,
}

impl RetentionPolicy {
    pub fn as_setting(self) -> i64 {
        match self {
            RetentionPolicy::Days(days) => i64::from(days),
            RetentionPolicy::OneMinute => 0,
            RetentionPolicy::Forever => -1,
            RetentionPolicy::DoNotSave => -2,
        }
    }

    pub fn persists(self) -> bool {
        self != RetentionPolicy::DoNotSave
    }

    /// Oldest timestamp to keep, or `None` when no age-based deletion applies.
    pub fn cutoff(self, now: i64) -> Option<i64> {
        match self {
            RetentionPolicy::Days(days) => Some(now - i64::from(days) * SECONDS_PER_DAY),
            RetentionPolicy::OneMinute => Some(now - ONE_MINUTE),
            RetentionPolicy::Forever | RetentionPolicy::DoNotSave => None,
        }
    }

    /// Window for per-app usage queries; 0 means all stored history.
    pub fn window_days(self) -> i64 {
        match self {
            RetentionPolicy::Days(days) => i64::from(days),
            _ => 0,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Days(30)
    }
}

impl TryFrom<i64> for RetentionPolicy {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            -2 => Ok(RetentionPolicy::DoNotSave),
            -1 => Ok(RetentionPolicy::Forever),
            0 => Ok(RetentionPolicy::OneMinute),
            n if n > 0 => u32::try_from(n)
                .map(RetentionPolicy::Days)
                .map_err(|_| format!("retention of {} days is out of range", n)),
            n => Err(format!("invalid data retention: {}", n)),
        }
    }
}

impl From<RetentionPolicy> for i64 {
    fn from(policy: RetentionPolicy) -> Self {
        policy.as_setting()
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Days(days) => write!(f, "{} days", days),
            RetentionPolicy::OneMinute => write!(f, "1 minute"),
            RetentionPolicy::Forever => write!(f, "forever"),
            RetentionPolicy::DoNotSave => write!(f, "do not save"),
        }
    }
}

/// Which steps one retention run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPass {
    pub expire: bool,
    pub age: bool,
    pub vacuum: bool,
}

impl RetentionPass {
    /// Frequent pass: raw-record expiry plus the policy cutoff.
    pub const EXPIRY: RetentionPass = RetentionPass { expire: true, age: true, vacuum: false };
    /// Date-based sweep only.
    pub const SWEEP: RetentionPass = RetentionPass { expire: false, age: true, vacuum: false };
    /// Everything, then reclaim space. Also used for interactive retention changes.
    pub const FULL: RetentionPass = RetentionPass { expire: true, age: true, vacuum: true };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub expired: usize,
    pub aged_out: usize,
    pub vacuumed: bool,
}

pub fn run(
    db: &Database,
    policy: RetentionPolicy,
    pass: RetentionPass,
    now: i64,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    if pass.expire {
        report.expired = db.delete_expired()?;
    }
    if pass.age {
        if let Some(cutoff) = policy.cutoff(now) {
            report.aged_out = db.delete_older_than(cutoff)?;
        }
    }
    if pass.vacuum {
        db.vacuum()?;
        report.vacuumed = true;
    }
    Ok(report)
}
