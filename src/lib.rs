#[macro_use]
mod macros;

mod common; // common to all layers
pub mod config;
mod net; // reactor, sockets, acceptor
mod protocol; // wire format, commands, endpoint
mod runtime; // coordinator, server, client
pub mod sync;

#[cfg(test)]
mod test;

pub use config::HlcpConfig;
pub use protocol::{
    types::{
        CountersAggregate, LogLevel, NicState, RankCounters, RankInfoHeader,
        RemoteDeviceConnectionInfo, SyncKind, UniqueId,
    },
    CommandId, Rank,
};
pub use runtime::{
    errors, ClientPhase, CommId, CoordContext, GroupState, HlcpClient, HlcpServer,
    MigrationCallback,
};
