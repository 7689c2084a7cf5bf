use crate::common::*;
use crate::net::reactor::{EventAction, IoClient, Reactor};
use mio::unix::UnixReady;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{
    ErrorKind::{Interrupted, UnexpectedEof, WouldBlock, WriteZero},
    Read, Write,
};

const LISTEN_BACKLOG: i32 = 512;

/// Callbacks for socket-level happenings. Every method defaults to a no-op.
pub(crate) trait SocketNotify: Send + Sync {
    fn on_accept(&self, _listener: Token, _stream: TcpStream, _peer: SocketAddr) {}
    fn on_error(&self, _token: Token, _err: std::io::ErrorKind) {}
    fn on_disconnect(&self, _token: Token) {}
}

/// Completion of a socket operation, as observed by `SocketIo::handle_ready`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IoEvent {
    Sent,
    Received(Payload),
    Failed(std::io::ErrorKind),
    Closed,
}

#[derive(Debug)]
struct PartialOp {
    buf: Vec<u8>,
    offset: usize,
}

/// A non-blocking stream with at most one send and one receive in flight.
/// Ops only progress from `handle_ready`; the owner arms the reactor after queueing.
#[derive(Debug)]
pub(crate) struct SocketIo {
    stream: TcpStream,
    peer: SocketAddr,
    send_op: Option<PartialOp>,
    recv_op: Option<PartialOp>,
    closed: bool,
}

/// A listening socket. Accepted streams are handed to `SocketNotify::on_accept`.
pub(crate) struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
    notify: Weak<dyn SocketNotify>,
}

///////////////////// IMPL /////////////////////

/// Connects to `peer` within `timeout`, optionally bound to the local interface `ifname`.
pub(crate) fn connect(peer: SocketAddr, timeout: Duration, ifname: &str) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
    if !ifname.is_empty() {
        socket.bind_device(Some(ifname.as_bytes()))?;
    }
    socket.set_nodelay(true)?;
    socket.connect_timeout(&peer.into(), timeout.max(Duration::from_millis(1)))?;
    socket.set_nonblocking(true)?;
    TcpStream::from_stream(socket.into())
}

/// Binds (with `SO_REUSEADDR`) and listens on `addr`. Port 0 picks a free port;
/// the listener's `local_addr` reports the one actually bound.
pub(crate) fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

impl SocketIo {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer, send_op: None, recv_op: None, closed: false }
    }
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
    pub fn is_closed(&self) -> bool {
        self.closed
    }
    pub fn is_sending(&self) -> bool {
        self.send_op.is_some()
    }
    pub fn is_receiving(&self) -> bool {
        self.recv_op.is_some()
    }
    pub fn has_pending(&self) -> bool {
        self.is_sending() || self.is_receiving()
    }

    /// Queue `buf` for sending. A second send before the first completes is a logic error.
    pub fn send(&mut self, buf: Vec<u8>) {
        assert!(self.send_op.is_none(), "send already in flight on socket to {}", self.peer);
        self.send_op = Some(PartialOp { buf, offset: 0 });
    }

    /// Queue a receive of exactly `len` bytes. A second receive before the first completes is a logic error.
    pub fn recv(&mut self, len: usize) {
        assert!(self.recv_op.is_none(), "recv already in flight on socket to {}", self.peer);
        self.recv_op = Some(PartialOp { buf: vec![0; len], offset: 0 });
    }

    /// Readable only while receiving, so unread bytes cannot spin an idle socket.
    /// A hangup is watched for regardless.
    pub fn interest(&self) -> Ready {
        let mut interest = Ready::from(UnixReady::hup());
        if self.recv_op.is_some() {
            interest.insert(Ready::readable());
        }
        if self.send_op.is_some() {
            interest.insert(Ready::writable());
        }
        interest
    }

    pub fn register(&self, poll: &Poll, token: Token, interest: Ready, fresh: bool) -> std::io::Result<()> {
        let opts = PollOpt::edge() | PollOpt::oneshot();
        if fresh {
            poll.register(&self.stream, token, interest, opts)
        } else {
            poll.reregister(&self.stream, token, interest, opts)
        }
    }

    pub fn deregister(&self, poll: &Poll) -> std::io::Result<()> {
        poll.deregister(&self.stream)
    }

    /// Progress every queued op as far as the OS allows, appending completions to `out`.
    /// After a `Failed` or `Closed` nothing else is reported.
    pub fn handle_ready(&mut self, readiness: Ready, out: &mut Vec<IoEvent>) {
        if self.closed {
            return;
        }
        let unix = UnixReady::from(readiness);
        if unix.is_error() {
            let kind = match self.stream.take_error() {
                Ok(Some(e)) => e.kind(),
                _ => std::io::ErrorKind::ConnectionReset,
            };
            out.push(IoEvent::Failed(kind));
            return;
        }
        // decided up front: a receive in flight discovers EOF by reading
        let idle_hangup = unix.is_hup() && self.recv_op.is_none();
        if self.send_op.is_some() {
            match self.flush_send() {
                Ok(true) => out.push(IoEvent::Sent),
                Ok(false) => {}
                Err(e) => {
                    out.push(IoEvent::Failed(e.kind()));
                    return;
                }
            }
        }
        if self.recv_op.is_some() {
            match self.fill_recv() {
                Ok(Some(buf)) => out.push(IoEvent::Received(buf)),
                Ok(None) => {}
                Err(e) if e.kind() == UnexpectedEof => {
                    out.push(IoEvent::Closed);
                    return;
                }
                Err(e) => {
                    out.push(IoEvent::Failed(e.kind()));
                    return;
                }
            }
        }
        if idle_hangup {
            out.push(IoEvent::Closed);
        }
    }

    // Ok(true) IFF the queued send completed
    fn flush_send(&mut self) -> std::io::Result<bool> {
        if let Some(op) = self.send_op.as_mut() {
            while op.offset < op.buf.len() {
                match self.stream.write(&op.buf[op.offset..]) {
                    Ok(0) => return Err(WriteZero.into()),
                    Ok(n) => op.offset += n,
                    Err(e) if e.kind() == WouldBlock => return Ok(false),
                    Err(e) if e.kind() == Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(self.send_op.take().is_some())
    }

    // Ok(Some(_)) IFF the queued receive completed
    fn fill_recv(&mut self) -> std::io::Result<Option<Payload>> {
        if let Some(op) = self.recv_op.as_mut() {
            while op.offset < op.buf.len() {
                match self.stream.read(&mut op.buf[op.offset..]) {
                    Ok(0) => return Err(UnexpectedEof.into()),
                    Ok(n) => op.offset += n,
                    Err(e) if e.kind() == WouldBlock => return Ok(None),
                    Err(e) if e.kind() == Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(self.recv_op.take().map(|op| op.buf))
    }

    /// Abandons queued ops and shuts the stream down. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.send_op = None;
            self.recv_op = None;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Acceptor {
    pub fn new(listener: TcpListener, notify: Weak<dyn SocketNotify>) -> std::io::Result<Self> {
        let local = listener.local_addr()?;
        Ok(Self { listener, local, notify })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl IoClient for Acceptor {
    fn interest(&self) -> Ready {
        Ready::readable()
    }
    fn monitor(&self, poll: &Poll, token: Token, interest: Ready, fresh: bool) -> std::io::Result<()> {
        let opts = PollOpt::edge() | PollOpt::oneshot();
        if fresh {
            poll.register(&self.listener, token, interest, opts)
        } else {
            poll.reregister(&self.listener, token, interest, opts)
        }
    }
    fn unmonitor(&self, poll: &Poll) -> std::io::Result<()> {
        poll.deregister(&self.listener)
    }
    fn on_event(&self, _reactor: &Reactor, token: Token, _readiness: Ready) -> EventAction {
        let notify = match self.notify.upgrade() {
            Some(notify) => notify,
            None => return EventAction::Nothing,
        };
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!("accepted {} on {}", peer, self.local);
                    notify.on_accept(token, stream, peer);
                }
                Err(e) if e.kind() == WouldBlock => break,
                Err(e) if e.kind() == Interrupted => continue,
                Err(e) => {
                    // one failed accept never stops the listener
                    warn!("accept on {} failed: {}", self.local, e);
                    notify.on_error(token, e.kind());
                    break;
                }
            }
        }
        EventAction::Rearm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SocketIo, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect(addr, Duration::from_secs(5), "").unwrap();
        let (raw, _) = listener.accept().unwrap();
        (SocketIo::new(stream, addr), raw)
    }

    fn drive(io: &mut SocketIo, until: impl Fn(&[IoEvent]) -> bool) -> Vec<IoEvent> {
        let mut out = vec![];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !until(&out) && Instant::now() < deadline {
            io.handle_ready(Ready::readable() | Ready::writable(), &mut out);
            std::thread::sleep(Duration::from_millis(1));
        }
        out
    }

    #[test]
    fn partial_ops_complete() {
        let (mut io, mut raw) = pair();
        io.send(b"hello".to_vec());
        io.recv(3);
        assert!(io.has_pending());
        assert!(io.interest().is_writable() && io.interest().is_readable());
        raw.write_all(b"a").unwrap();
        let out = drive(&mut io, |o| o.contains(&IoEvent::Sent));
        assert_eq!(out, vec![IoEvent::Sent]);
        let mut got = [0u8; 5];
        raw.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");
        // the rest of the 3 bytes arrives later
        raw.write_all(b"bc").unwrap();
        let out = drive(&mut io, |o| !o.is_empty());
        assert_eq!(out, vec![IoEvent::Received(b"abc".to_vec())]);
        assert!(!io.has_pending());
    }

    #[test]
    fn eof_while_receiving_is_closed() {
        let (mut io, raw) = pair();
        io.recv(4);
        drop(raw);
        let out = drive(&mut io, |o| !o.is_empty());
        assert_eq!(out, vec![IoEvent::Closed]);
    }

    #[test]
    fn idle_interest_is_hangup_only() {
        let (io, _raw) = pair();
        assert!(!io.interest().is_readable());
        assert!(!io.interest().is_writable());
        assert!(UnixReady::from(io.interest()).is_hup());
    }

    #[test]
    #[should_panic]
    fn second_concurrent_send_panics() {
        let (mut io, _raw) = pair();
        io.send(vec![1]);
        io.send(vec![2]);
    }

    #[test]
    fn listen_reports_bound_port() {
        struct Nobody;
        impl SocketNotify for Nobody {}
        let notify: Arc<dyn SocketNotify> = Arc::new(Nobody);
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let acceptor = Acceptor::new(listener, Arc::downgrade(&notify)).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
    }
}
