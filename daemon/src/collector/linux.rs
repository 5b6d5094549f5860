use super::{ByteCounters, Connection, CounterSource, ProcessIdentity, SystemSnapshot, TcpState};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const SOCKET_LINK_PREFIX: &str = "socket:[";

pub struct LinuxCounterSource {
    proc_root: PathBuf,
    include_loopback: bool,
    interface: RwLock<Option<String>>,
    generation: AtomicU64,
}

impl LinuxCounterSource {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Read from an alternate procfs mount (containers, tests).
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            include_loopback: false,
            interface: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn include_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    /// Restrict aggregate counters to one interface. Empty or `None` means all.
    pub fn set_interface(&self, interface: Option<String>) {
        let interface = interface.filter(|name| !name.trim().is_empty());
        let mut current = self.interface.write();
        if *current != interface {
            *current = interface;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counters plus the filter generation they were summed under.
    fn read_counters(&self) -> Result<(ByteCounters, u64)> {
        let path = self.proc_root.join("net/dev");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let interface = self.interface.read();
        let generation = self.generation.load(Ordering::SeqCst);
        let counters = parse_net_dev(&content, interface.as_deref(), self.include_loopback);
        Ok((counters, generation))
    }

    fn read_table(&self, name: &str, required: bool) -> Result<Vec<SocketEntry>> {
        let path = self.proc_root.join("net").join(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(parse_socket_table(&content)),
            Err(e) if !required => {
                debug!("Skipping {}: {}", path.display(), e);
                Ok(Vec::new())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Map socket inode to owning pid with one pass over `/proc/<pid>/fd`.
    fn socket_owners(&self) -> HashMap<u64, u32> {
        let mut owners = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return owners;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Other users' fd directories are unreadable without privileges.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if let Some(inode) = parse_socket_link(&link.to_string_lossy()) {
                        owners.entry(inode).or_insert(pid);
                    }
                }
            }
        }
        owners
    }
}

impl Default for LinuxCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for LinuxCounterSource {
    fn sample(&self) -> Result<SystemSnapshot> {
        let (counters, generation) = self.read_counters()?;

        let mut tcp = self.read_table("tcp", true)?;
        tcp.extend(self.read_table("tcp6", false)?);
        let mut udp = self.read_table("udp", true)?;
        udp.extend(self.read_table("udp6", false)?);

        if tcp.is_empty() && udp.is_empty() {
            return Ok(SystemSnapshot { counters, connections: Vec::new(), generation });
        }

        let owners = self.socket_owners();
        let mut connections = Vec::with_capacity(tcp.len() + udp.len());
        for entry in tcp {
            if let Some(&pid) = owners.get(&entry.inode) {
                connections.push(Connection::tcp(pid, TcpState::from_hex(&entry.state)));
            }
        }
        for entry in udp {
            if let Some(&pid) = owners.get(&entry.inode) {
                connections.push(Connection::udp(pid));
            }
        }

        Ok(SystemSnapshot { counters, connections, generation })
    }

    fn resolve(&self, pid: u32) -> Option<ProcessIdentity> {
        let proc_dir = self.proc_root.join(pid.to_string());
        if let Ok(exe) = fs::read_link(proc_dir.join("exe")) {
            let path = exe.to_string_lossy();
            let path = path.trim_end_matches(" (deleted)").to_string();
            if let Some(name) = base_name(&path) {
                return Some(ProcessIdentity { name, executable_path: Some(path) });
            }
        }
        // Kernel threads and other users' processes have no readable exe link.
        let comm = fs::read_to_string(proc_dir.join("comm")).ok()?;
        let name = comm.trim();
        if name.is_empty() {
            return None;
        }
        Some(ProcessIdentity { name: name.to_string(), executable_path: None })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub state: String,
    pub inode: u64,
}

/// Sum receive/transmit byte columns of `/proc/net/dev`.
pub fn parse_net_dev(content: &str, interface: Option<&str>, include_loopback: bool) -> ByteCounters {
    let mut counters = ByteCounters::default();
    for line in content.lines().skip(2) {
        let Some((name, stats)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        match interface {
            Some(wanted) if name != wanted => continue,
            None if name == "lo" && !include_loopback => continue,
            _ => {}
        }
        let fields: Vec<&str> = stats.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let rx: u64 = fields[0].parse().unwrap_or(0);
        let tx: u64 = fields[8].parse().unwrap_or(0);
        counters.download = counters.download.saturating_add(rx);
        counters.upload = counters.upload.saturating_add(tx);
    }
    counters
}

/// Extract state and inode from `/proc/net/{tcp,udp}[6]`. Rows with inode 0
/// (sockets already detached from any process) are dropped.
pub fn parse_socket_table(content: &str) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                return None;
            }
            let inode: u64 = parts[9].parse().ok()?;
            if inode == 0 {
                return None;
            }
            Some(SocketEntry { state: parts[3].to_string(), inode })
        })
        .collect()
}

fn parse_socket_link(link: &str) -> Option<u64> {
    link.strip_prefix(SOCKET_LINK_PREFIX)?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn base_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}
