//! Network counter sources (reads /proc on Linux)

pub mod linux;

pub use linux::LinuxCounterSource;

/// TCP connection state as reported by the kernel socket tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl TcpState {
    /// Decode the two-digit hex state column of `/proc/net/tcp`.
    pub fn from_hex(hex: &str) -> Self {
        match hex {
            "01" => TcpState::Established,
            "02" => TcpState::SynSent,
            "03" => TcpState::SynRecv,
            "04" => TcpState::FinWait1,
            "05" => TcpState::FinWait2,
            "06" => TcpState::TimeWait,
            "07" => TcpState::Close,
            "08" => TcpState::CloseWait,
            "09" => TcpState::LastAck,
            "0A" | "0a" => TcpState::Listen,
            "0B" | "0b" => TcpState::Closing,
            _ => TcpState::Unknown,
        }
    }

    pub fn is_established(self) -> bool {
        self == TcpState::Established
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(TcpState),
    Udp,
}

/// A live socket and the process that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub pid: u32,
    pub endpoint: Endpoint,
}

impl Connection {
    pub fn tcp(pid: u32, state: TcpState) -> Self {
        Self { pid, endpoint: Endpoint::Tcp(state) }
    }

    pub fn udp(pid: u32) -> Self {
        Self { pid, endpoint: Endpoint::Udp }
    }
}

/// Cumulative interface byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub upload: u64,
    pub download: u64,
}

impl ByteCounters {
    pub fn new(upload: u64, download: u64) -> Self {
        Self { upload, download }
    }

    /// Bytes moved since `previous`. A counter that went backwards (interface
    /// reset, counter wrap) contributes zero.
    pub fn delta_since(&self, previous: &ByteCounters) -> ByteCounters {
        ByteCounters {
            upload: self.upload.saturating_sub(previous.upload),
            download: self.download.saturating_sub(previous.download),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    pub counters: ByteCounters,
    pub connections: Vec<Connection>,
    /// Changes whenever the counters stop being comparable with earlier
    /// samples, e.g. after the interface filter was switched.
    pub generation: u64,
}

/// Display identity of a process: executable base name plus full path when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub name: String,
    pub executable_path: Option<String>,
}

pub trait CounterSource: Send + Sync {
    /// Read aggregate counters and the current TCP/UDP ownership tables.
    fn sample(&self) -> anyhow::Result<SystemSnapshot>;

    /// Best-effort pid lookup. `None` means the pid is gone or unreadable.
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity>;
}
