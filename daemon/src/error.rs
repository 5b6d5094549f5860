//! Error types for the store and the monitor lifecycle

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database file is {size} bytes, exceeding the {limit} byte safety limit")]
    SizeLimit { size: u64, limit: u64 },

    #[error("insufficient disk space: {available} bytes available, need at least {required} bytes")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("invalid value {value:?} for setting {key}: {reason}")]
    InvalidSetting { key: String, value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor already started")]
    AlreadyStarted,

    #[error("monitor is stopped")]
    Stopped,

    #[error("counter source failed: {0:#}")]
    Source(#[from] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
