//! Scripted counter source shared by the integration tests

#![allow(dead_code)]

use anyhow::anyhow;
use netusage_daemon::collector::{
    ByteCounters, Connection, CounterSource, ProcessIdentity, SystemSnapshot,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Replays queued snapshots; once the script runs out the last snapshot repeats.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Option<SystemSnapshot>>>,
    last: Mutex<SystemSnapshot>,
    names: Mutex<HashMap<u32, String>>,
    generation: Mutex<u64>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self, pid: u32, name: &str) -> &Self {
        self.names.lock().insert(pid, name.to_string());
        self
    }

    pub fn push(&self, upload: u64, download: u64, connections: Vec<Connection>) -> &Self {
        self.script.lock().push_back(Some(SystemSnapshot {
            counters: ByteCounters::new(upload, download),
            connections,
            generation: *self.generation.lock(),
        }));
        self
    }

    /// Snapshots queued after this call belong to a new counter baseline.
    pub fn rebase(&self) -> &Self {
        *self.generation.lock() += 1;
        self
    }

    /// Queue a failing sample.
    pub fn push_error(&self) -> &Self {
        self.script.lock().push_back(None);
        self
    }
}

impl CounterSource for ScriptedSource {
    fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        match self.script.lock().pop_front() {
            Some(Some(snapshot)) => {
                *self.last.lock() = snapshot.clone();
                Ok(snapshot)
            }
            Some(None) => Err(anyhow!("counters unavailable")),
            None => Ok(self.last.lock().clone()),
        }
    }

    fn resolve(&self, pid: u32) -> Option<ProcessIdentity> {
        self.names.lock().get(&pid).map(|name| ProcessIdentity {
            name: name.clone(),
            executable_path: Some(format!("/usr/bin/{}", name)),
        })
    }
}
