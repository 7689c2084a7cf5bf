pub mod errors;

pub(crate) mod client;
pub(crate) mod connection;
pub(crate) mod context;
pub(crate) mod coordinator;
pub(crate) mod server;

use crate::protocol::types::NicState;

pub use client::HlcpClient;
pub use context::CoordContext;
pub use server::HlcpServer;

/// Identifies one communicator within a `CoordContext`.
pub type CommId = u32;

/// Server-side lifecycle of a group of ranks.
/// `Inactive -> Active -> Operational`, and back to `Active` when a new `RANK_DATA`
/// round re-forms the group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GroupState {
    Inactive,
    Active,
    Operational,
}

/// Which bootstrap exchange a client performs next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ClientPhase {
    CommData,
    QpsConf,
    ConfDone,
}

/// Receives scale-out port changes the server broadcasts.
/// Invoked on a reactor thread; must not block on coordination operations.
pub trait MigrationCallback: Send + Sync {
    fn nic_state_change(&self, state: &NicState);
}
