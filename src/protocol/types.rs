//! Records exchanged between ranks and the coordination server.

use crate::common::*;
use crate::protocol::{
    serde::{De, Ser},
    Rank,
};
use crate::runtime::errors::EndpointErr;
use std::net::Ipv4Addr;

/// Bytes reserved for the hostname on the wire, NUL padding included.
pub const HOSTNAME_SIZE: usize = 64;

/// Wire size of an encoded `RankInfoHeader`.
pub const RANK_INFO_HEADER_SIZE: usize = 4 + 4 + 4 + HOSTNAME_SIZE + 20 + 8 + 1 + 8;

/// Size of the out-of-band blob identifying a coordination server.
pub const UNIQUE_ID_SIZE: usize = 128;

/// Scale-out ports are tracked as bits of a `u64` mask.
pub const MAX_SCALEOUT_PORTS: u32 = 64;

/// Per-rank descriptor, sent once to the server and echoed back in the rank table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankInfoHeader {
    pub hccl_rank: Rank,
    /// Ranks sharing this rank's physical host
    pub box_size: u32,
    pub hw_module_id: u32,
    /// At most `HOSTNAME_SIZE - 1` bytes
    pub hostname: String,
    /// Where this rank's coordinator listens. The server fills in an unspecified IP
    /// from the address the rank connected from.
    pub caddr: SocketAddr,
    pub api_counter: u64,
    /// IP (true) or MAC (false) based scale-out addressing
    pub ip_addressing: bool,
    pub failed_scaleout_ports: u64,
}

/// Everything one rank needs to reach another over the scale-out fabric.
/// Travels as an opaque blob (`to_blob` / `from_blob`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeviceConnectionInfo {
    pub header: RankInfoHeader,
    /// One address per NIC
    pub nic_addrs: Vec<IpAddr>,
    /// Queue-pair numbers, indexed `[nic][qp_set]`
    pub qp_numbers: Vec<Vec<u32>>,
    /// Opaque host-NIC connection data
    pub host_nic_blob: Payload,
}

/// One rank's fault-tolerance progress, as reported by that rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankCounters {
    pub rank: Rank,
    pub collectives: u64,
    /// The rank has reached the point it is waiting at
    pub reached: bool,
    /// `sent[j]`: what this rank has sent to rank `j`
    pub sent: Vec<u64>,
    /// `observed[j]`: what this rank has received from rank `j`
    pub observed: Vec<u64>,
}

/// The server's verdict over every rank's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountersAggregate {
    pub all_reached: bool,
    /// Indexed by rank
    pub counters: Vec<RankCounters>,
}

/// A scale-out port changing state on one rank.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NicState {
    pub rank: Rank,
    pub nic: u32,
    pub up: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SyncKind {
    Rendezvous,
    /// Completion of a migration fail-over or fail-back cycle
    MigrationDone,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Info,
    Error,
    /// Group-wide; every receiving rank fails its pending waits
    Critical,
}

/// Identity of a coordination server, published out of band to every rank.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct UniqueId {
    bytes: [u8; UNIQUE_ID_SIZE],
}

///////////////////// IMPL /////////////////////

impl RankInfoHeader {
    pub fn new(hccl_rank: Rank, box_size: u32, hostname: &str) -> Self {
        Self {
            hccl_rank,
            box_size,
            hw_module_id: 0,
            hostname: hostname.to_owned(),
            caddr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            api_counter: 0,
            ip_addressing: true,
            failed_scaleout_ports: 0,
        }
    }
}

impl RemoteDeviceConnectionInfo {
    pub fn to_blob(&self) -> Payload {
        let mut blob = Vec::new();
        // writing into a Vec never fails
        let _ = blob.ser(self);
        blob
    }
    pub fn from_blob(blob: &[u8]) -> Result<Self, EndpointErr> {
        let mut r = blob;
        let info = De::<Self>::de(&mut r).map_err(|_| EndpointErr::MalformedBlob)?;
        if !r.is_empty() {
            return Err(EndpointErr::MalformedBlob);
        }
        Ok(info)
    }
}

impl RankCounters {
    pub fn new(rank: Rank, comm_size: usize) -> Self {
        Self { rank, collectives: 0, reached: false, sent: vec![0; comm_size], observed: vec![0; comm_size] }
    }
}

impl CountersAggregate {
    /// Every rank reached, and every rank's self-reported sends match what each
    /// receiver observed from it. `counters` must be indexed by rank.
    pub fn evaluate(counters: Vec<RankCounters>) -> Self {
        let n = counters.len();
        let all_reached = counters.iter().all(|c| c.reached)
            && (0..n).all(|r| {
                (0..n).filter(|&j| j != r).all(|j| counters[r].sent.get(j) == counters[j].observed.get(r))
            });
        Self { all_reached, counters }
    }
}

impl LogLevel {
    pub fn code(self) -> u8 {
        match self {
            LogLevel::Trace => 0,
            LogLevel::Info => 1,
            LogLevel::Error => 2,
            LogLevel::Critical => 3,
        }
    }
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => LogLevel::Trace,
            1 => LogLevel::Info,
            2 => LogLevel::Error,
            3 => LogLevel::Critical,
            _ => return None,
        })
    }
    pub fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Info => log::Level::Info,
            LogLevel::Error | LogLevel::Critical => log::Level::Error,
        }
    }
}

impl UniqueId {
    pub fn from_addr(addr: SocketAddr) -> Self {
        let mut bytes = [0u8; UNIQUE_ID_SIZE];
        let mut w = &mut bytes[..];
        // an address is far smaller than the blob
        let _ = w.ser(&addr);
        Self { bytes }
    }
    pub fn from_bytes(bytes: [u8; UNIQUE_ID_SIZE]) -> Self {
        Self { bytes }
    }
    pub fn as_bytes(&self) -> &[u8; UNIQUE_ID_SIZE] {
        &self.bytes
    }
    /// The server address, or `None` for a blob that does not hold one.
    pub fn addr(&self) -> Option<SocketAddr> {
        De::<SocketAddr>::de(&mut &self.bytes[..]).ok()
    }
}
impl Debug for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.addr() {
            Some(addr) => write!(f, "UniqueId({})", addr),
            None => write!(f, "UniqueId(<invalid>)"),
        }
    }
}
