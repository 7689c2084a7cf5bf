pub(crate) mod command;
pub(crate) mod endpoint;
pub(crate) mod serde;
pub mod types;

use crate::protocol::serde::{De, Ser};
use crate::runtime::errors::EndpointErr;

pub(crate) use command::Command;

pub type Rank = u32;

/// Rank field of commands originating at the coordination server.
pub const SERVER_RANK: Rank = Rank::MAX;

pub const MAGIC: [u8; 4] = *b"HLCP";
pub const HLCP_VERSION: u32 = 1;
pub const PACKET_ACK: u32 = 1;
pub const PACKET_DATA: u32 = 2;
pub const FOOTER: u32 = 0xFEED_C0DE;
pub const PARAM_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 16;
pub const MESSAGE_SIZE: usize = 4 + PARAM_SIZE + 4;
pub const HLCP_CMD_BASE: u32 = 1000;

/// The coordination command catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// rank -> server: the rank's header
    RankData,
    /// server -> rank: the whole rank table
    CommData,
    /// rank -> server: connection row. server -> rank: connection column
    QpsConf,
    /// rank -> rank: an identified blob
    NonPeers,
    /// rank -> server telemetry. server -> rank only for group-wide errors
    LogMsg,
    /// rendezvous request and release
    Sync,
    /// rank -> server -> every rank
    NicState,
    /// fault-tolerance counters, reported and fanned out
    CountersData,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PacketType {
    Ack,
    Data,
}

/// The fixed-size part of a data packet following the header.
#[derive(Debug)]
pub(crate) struct Message {
    pub id: u32,
    pub param: [u8; PARAM_SIZE],
    pub payload_size: u32,
}

///////////////////// IMPL /////////////////////

impl CommandId {
    pub const ALL: [CommandId; 8] = [
        CommandId::RankData,
        CommandId::CommData,
        CommandId::QpsConf,
        CommandId::NonPeers,
        CommandId::LogMsg,
        CommandId::Sync,
        CommandId::NicState,
        CommandId::CountersData,
    ];
    pub fn wire(self) -> u32 {
        use CommandId::*;
        HLCP_CMD_BASE
            + match self {
                RankData => 10,
                CommData => 20,
                QpsConf => 30,
                NonPeers => 40,
                LogMsg => 50,
                Sync => 60,
                NicState => 70,
                CountersData => 80,
            }
    }
    pub fn from_wire(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.wire() == id)
    }
}

impl PacketType {
    fn wire(self) -> u32 {
        match self {
            PacketType::Ack => PACKET_ACK,
            PacketType::Data => PACKET_DATA,
        }
    }
}

pub(crate) fn encode_header(kind: PacketType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&MAGIC);
    let _ = buf.ser(&HLCP_VERSION);
    let _ = buf.ser(&kind.wire());
    let _ = buf.ser(&FOOTER);
    buf
}

/// Accepts any version up to our own.
pub(crate) fn decode_header(buf: &[u8]) -> Result<PacketType, EndpointErr> {
    if buf.len() != HEADER_SIZE || buf[..4] != MAGIC {
        return Err(EndpointErr::BadMagic);
    }
    let mut r = &buf[4..];
    let read = |r: &mut &[u8]| De::<u32>::de(r).map_err(|_| EndpointErr::BadMagic);
    let version = read(&mut r)?;
    let packet_type = read(&mut r)?;
    let footer = read(&mut r)?;
    if version > HLCP_VERSION {
        return Err(EndpointErr::BadVersion(version));
    }
    if footer != FOOTER {
        return Err(EndpointErr::BadFooter(footer));
    }
    match packet_type {
        PACKET_ACK => Ok(PacketType::Ack),
        PACKET_DATA => Ok(PacketType::Data),
        other => Err(EndpointErr::BadPacketType(other)),
    }
}

impl Message {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let _ = buf.ser(&self.id);
        buf.extend_from_slice(&self.param);
        let _ = buf.ser(&self.payload_size);
    }
    pub fn decode(buf: &[u8]) -> Result<Self, EndpointErr> {
        if buf.len() != MESSAGE_SIZE {
            return Err(EndpointErr::Io(std::io::ErrorKind::UnexpectedEof));
        }
        let mut param = [0u8; PARAM_SIZE];
        param.copy_from_slice(&buf[4..4 + PARAM_SIZE]);
        let id = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tail = &buf[4 + PARAM_SIZE..];
        let payload_size = u32::from_ne_bytes([tail[0], tail[1], tail[2], tail[3]]);
        Ok(Self { id, param, payload_size })
    }
}
