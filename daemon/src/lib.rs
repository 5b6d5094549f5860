//! Per-process network usage daemon
//!
//! Samples interface byte counters, attributes each delta to processes by
//! their open sockets, and keeps a bounded history in SQLite.

pub mod batcher;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod retention;
pub mod sampler;
pub mod settings;
pub mod socket;
pub mod stats;
