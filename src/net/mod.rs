pub(crate) mod reactor;
pub(crate) mod socket;

pub(crate) use reactor::{EventAction, IoClient, Reactor};
pub(crate) use socket::{connect, listen, Acceptor, IoEvent, SocketIo, SocketNotify};
