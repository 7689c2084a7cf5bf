use crate::common::*;
use crate::net::{EventAction, IoClient, IoEvent, Reactor, SocketIo, SocketNotify};
use crate::protocol::{
    endpoint::{Endpoint, Expect, Inbound, Outbound},
    Command,
};
use crate::runtime::{
    coordinator::Coordinator,
    errors::{ConnErr, EndpointErr},
};
use crate::sync::Monitor;

/// `Closing`: an ack is queued and the connection is torn down once it is flushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConnState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct ConnInner {
    io: SocketIo,
    endpoint: Endpoint,
    state: ConnState,
    acks: usize,
    sent: usize,
    failed: Option<EndpointErr>,
}

/// One short-lived TCP connection and its protocol endpoint.
/// The reactor lock may be taken before the connection lock, never the other way round.
pub(crate) struct Connection {
    token: Token,
    peer: SocketAddr,
    reactor: Reactor,
    coord: Weak<Coordinator>,
    inner: Monitor<ConnInner>,
}

// What an event produced, acted upon after the connection lock is released.
#[derive(Debug, Default)]
struct Outcome {
    commands: Vec<Command>,
    failure: Option<EndpointErr>,
    ack_flushed: bool,
    peer_closed: bool,
}

///////////////////// IMPL /////////////////////

impl Connection {
    pub fn new(
        token: Token,
        reactor: Reactor,
        coord: Weak<Coordinator>,
        stream: TcpStream,
        peer: SocketAddr,
        max_payload: usize,
    ) -> Self {
        let inner = ConnInner {
            io: SocketIo::new(stream, peer),
            endpoint: Endpoint::new(max_payload),
            state: ConnState::Open,
            acks: 0,
            sent: 0,
            failed: None,
        };
        Self { token, peer, reactor, coord, inner: Monitor::new(inner) }
    }

    pub fn token(&self) -> Token {
        self.token
    }
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    // runs `f` on an open, healthy connection, then arms it
    fn with_open<R>(&self, f: impl FnOnce(&mut ConnInner) -> R) -> Result<R, ConnErr> {
        let r = {
            let mut inner = self.inner.lock();
            if let Some(e) = inner.failed {
                return Err(ConnErr::Endpoint(e));
            }
            if inner.state != ConnState::Open {
                return Err(ConnErr::Closed);
            }
            f(&mut *inner)
        };
        self.reactor.arm(self.token).map_err(|e| ConnErr::Endpoint(EndpointErr::Io(e.kind())))?;
        Ok(r)
    }

    pub fn receive(&self, expect: Expect) -> Result<(), ConnErr> {
        self.with_open(|i| i.endpoint.receive(expect, &mut i.io))
    }

    pub fn send_command(&self, cmd: &Command) -> Result<(), ConnErr> {
        self.with_open(|i| i.endpoint.send_command(cmd, &mut i.io))
    }

    /// Sends `cmd` with the receive side already armed for its ack, so an ack
    /// racing the peer's hangup is never missed.
    pub fn request(&self, cmd: &Command) -> Result<(), ConnErr> {
        self.with_open(|i| {
            i.endpoint.receive(Expect::Ack, &mut i.io);
            i.endpoint.send_command(cmd, &mut i.io);
        })
    }

    pub fn wait_ack(&self, timeout: Duration) -> Result<(), ConnErr> {
        self.wait_counted(timeout, true)
    }

    pub fn wait_sent(&self, timeout: Duration) -> Result<(), ConnErr> {
        self.wait_counted(timeout, false)
    }

    // consumes one ack (or one completed send)
    fn wait_counted(&self, timeout: Duration, acks: bool) -> Result<(), ConnErr> {
        let got = self.inner.wait_for(timeout, |i| {
            let n = if acks { &mut i.acks } else { &mut i.sent };
            if *n > 0 {
                *n -= 1;
                return Some(Ok(()));
            }
            match (i.failed, i.state) {
                (Some(e), _) => Some(Err(ConnErr::Endpoint(e))),
                (None, ConnState::Closed) => Some(Err(ConnErr::Closed)),
                _ => None,
            }
        });
        got.unwrap_or(Err(ConnErr::Timeout))
    }

    /// Queues the ack; teardown follows once it is flushed.
    pub(crate) fn begin_close(&self) -> Result<(), ConnErr> {
        self.with_open(|i| {
            i.state = ConnState::Closing;
            i.endpoint.send_ack(&mut i.io);
        })
    }

    /// Closes the socket and detaches it from the reactor. True IFF this call did it.
    pub(crate) fn teardown(&self) -> bool {
        let done = self.inner.update(|i| {
            if i.state == ConnState::Closed {
                false
            } else {
                i.state = ConnState::Closed;
                i.io.close();
                true
            }
        });
        if done {
            self.reactor.remove(self.token);
        }
        done
    }

    fn progress(&self, readiness: Ready) -> Option<Outcome> {
        let mut events = Vec::new();
        let mut out = Outcome::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.state == ConnState::Closed {
                return None;
            }
            inner.io.handle_ready(readiness, &mut events);
            for event in events {
                match event {
                    IoEvent::Sent => match inner.endpoint.on_sent(&mut inner.io) {
                        Some(Outbound::Sent) => inner.sent += 1,
                        Some(Outbound::AckSent) => out.ack_flushed = true,
                        None => {}
                    },
                    IoEvent::Received(buf) => match inner.endpoint.on_received(buf, &mut inner.io) {
                        Ok(Some(Inbound::Ack)) => inner.acks += 1,
                        Ok(Some(Inbound::Command(cmd))) => out.commands.push(cmd),
                        Ok(None) => {}
                        Err(e) => {
                            out.failure = Some(e);
                            break;
                        }
                    },
                    IoEvent::Failed(kind) => {
                        out.failure = Some(EndpointErr::Io(kind));
                        break;
                    }
                    IoEvent::Closed => {
                        out.peer_closed = true;
                        break;
                    }
                }
            }
            if let Some(e) = out.failure {
                inner.failed = Some(e);
            } else if out.peer_closed && inner.state == ConnState::Open {
                inner.failed = Some(EndpointErr::Disconnected);
            }
        }
        self.inner.notify_all();
        Some(out)
    }
}

impl IoClient for Connection {
    fn interest(&self) -> Ready {
        self.inner.lock().io.interest()
    }
    fn monitor(&self, poll: &Poll, token: Token, interest: Ready, fresh: bool) -> std::io::Result<()> {
        self.inner.lock().io.register(poll, token, interest, fresh)
    }
    fn unmonitor(&self, poll: &Poll) -> std::io::Result<()> {
        self.inner.lock().io.deregister(poll)
    }
    fn on_event(&self, _reactor: &Reactor, token: Token, readiness: Ready) -> EventAction {
        let out = match self.progress(readiness) {
            Some(out) => out,
            None => return EventAction::Nothing,
        };
        let coord = match self.coord.upgrade() {
            Some(coord) => coord,
            None => return EventAction::Nothing,
        };
        if self.state() == ConnState::Closing {
            if out.ack_flushed || out.peer_closed || out.failure.is_some() {
                if let Some(e) = out.failure {
                    debug!("ack to {} not delivered: {:?}", self.peer, e);
                }
                coord.finish_close(token);
                return EventAction::Nothing;
            }
            return EventAction::Rearm;
        }
        if let Some(e) = out.failure {
            coord.connection_failed(token, e);
            return EventAction::Nothing;
        }
        if out.peer_closed {
            SocketNotify::on_disconnect(&*coord, token);
            return EventAction::Nothing;
        }
        for cmd in out.commands {
            coord.dispatch_command(token, cmd);
        }
        EventAction::Rearm
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connection").field("token", &self.token).field("peer", &self.peer).finish()
    }
}
