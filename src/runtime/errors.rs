use crate::common::*;
use crate::protocol::{CommandId, Rank};
use crate::runtime::ClientPhase;
use std::io::ErrorKind;

/// Terminal failure of one connection's protocol stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointErr {
    BadMagic,
    BadVersion(u32),
    BadFooter(u32),
    BadPacketType(u32),
    /// A data packet where an ack was expected, or the other way around
    UnexpectedPacket,
    UnknownCommand(u32),
    UnexpectedCommand { expected: CommandId, got: CommandId },
    PayloadTooLarge { size: usize, max: usize },
    MalformedParam(CommandId),
    MalformedPayload(CommandId),
    MalformedBlob,
    Disconnected,
    Io(ErrorKind),
}

/// Failure of a single outbound exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnErr {
    Connect { peer: SocketAddr, kind: ErrorKind },
    Endpoint(EndpointErr),
    Timeout,
    /// The connection was torn down before the exchange completed
    Closed,
    /// The local coordinator is shutting down
    Shutdown,
}

/// Rejected server input. The offending connection is dropped without an ack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerErr {
    NotActive(CommandId),
    InvalidCommSize(u32),
    CommSizeMismatch { expected: u32, got: u32 },
    RankOutOfRange(Rank),
    Duplicate { cmd: CommandId, rank: Rank },
    RowSizeMismatch { rank: Rank, expected: usize, got: usize },
    PortOutOfRange(u32),
    Unexpected(CommandId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartErr {
    Reactor(ErrorKind),
    Bind { addr: SocketAddr, kind: ErrorKind },
    AlreadyStarted,
    InvalidUniqueId,
}

/// Failure of a client operation. Every variant aborts the operation; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientErr {
    WrongPhase { expected: ClientPhase, actual: ClientPhase },
    /// Nothing arrived for the named command within the operation timeout
    Timeout(CommandId),
    Conn(ConnErr),
    /// The server reported a group-wide error
    Fatal(String),
    DuplicateNonPeer(Rank),
    UnknownRank(Rank),
    RowSizeMismatch { expected: usize, got: usize },
    Start(StartErr),
}

impl From<EndpointErr> for ConnErr {
    fn from(e: EndpointErr) -> Self {
        ConnErr::Endpoint(e)
    }
}
impl From<ConnErr> for ClientErr {
    fn from(e: ConnErr) -> Self {
        ClientErr::Conn(e)
    }
}
impl From<EndpointErr> for ClientErr {
    fn from(e: EndpointErr) -> Self {
        ClientErr::Conn(ConnErr::Endpoint(e))
    }
}
impl From<StartErr> for ClientErr {
    fn from(e: StartErr) -> Self {
        ClientErr::Start(e)
    }
}
