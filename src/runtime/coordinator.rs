use crate::common::*;
use crate::config::HlcpConfig;
use crate::net::{self, Acceptor, Reactor, SocketNotify};
use crate::protocol::{endpoint::Expect, Command, Rank};
use crate::runtime::{
    connection::Connection,
    errors::{ConnErr, EndpointErr, StartErr},
};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

/// Protocol-level callbacks of a coordinator role (server or client).
pub(crate) trait HlcpNotify: Send + Sync {
    /// A peer connected to our listener. Default: wait for any command.
    fn on_connect(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>) {
        if let Err(e) = conn.receive(Expect::Any) {
            debug!("cannot receive from {}: {:?}", conn.peer_addr(), e);
            coord.drop_connection(conn);
        }
    }
    /// A complete command arrived. The handler decides between `close_connection`
    /// (ack) and `drop_connection` (no ack).
    fn on_command(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>, cmd: Command);
    /// The connection's protocol stream failed. Default: drop it.
    fn on_error(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>, err: EndpointErr) {
        warn!("dropping connection with {}: {:?}", conn.peer_addr(), err);
        coord.drop_connection(conn);
    }
    fn on_disconnect(&self, _coord: &Arc<Coordinator>, _peer: SocketAddr) {}
}

/// A listener, a reactor and the live connections between them.
pub(crate) struct Coordinator {
    me: Weak<Coordinator>,
    reactor: Reactor,
    local_addr: SocketAddr,
    connections: Mutex<HashMap<Token, Arc<Connection>>>,
    handler: Arc<dyn HlcpNotify>,
    config: HlcpConfig,
    closed: AtomicBool,
}

///////////////////// IMPL /////////////////////

impl Coordinator {
    /// Starts `io_threads` reactor workers and listens on `addr`.
    pub fn start(
        config: &HlcpConfig,
        io_threads: usize,
        addr: SocketAddr,
        handler: Arc<dyn HlcpNotify>,
    ) -> Result<Arc<Self>, StartErr> {
        let listener = net::listen(addr).map_err(|e| StartErr::Bind { addr, kind: e.kind() })?;
        let local_addr = listener.local_addr().map_err(|e| StartErr::Bind { addr, kind: e.kind() })?;
        let reactor = Reactor::start(io_threads).map_err(|e| StartErr::Reactor(e.kind()))?;
        let coord = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor: reactor.clone(),
            local_addr,
            connections: Default::default(),
            handler,
            config: config.clone(),
            closed: AtomicBool::new(false),
        });
        let notify: Weak<dyn SocketNotify> = coord.me.clone();
        let armed = Acceptor::new(listener, notify).and_then(|acceptor| {
            let token = reactor.add(Arc::new(acceptor));
            reactor.arm(token)
        });
        if let Err(e) = armed {
            reactor.close();
            return Err(StartErr::Reactor(e.kind()));
        }
        debug!("coordinator listening on {} with {} io threads", local_addr, io_threads);
        Ok(coord)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HlcpConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> Arc<Connection> {
        let me = self.me.clone();
        let max_payload = self.config.max_payload_size;
        let reactor = self.reactor.clone();
        let conn = self
            .reactor
            .add_with(|token| Arc::new(Connection::new(token, reactor, me, stream, peer, max_payload)));
        self.connections.lock().insert(conn.token(), conn.clone());
        conn
    }

    /// An outbound connection to `peer`, bound to the configured interface.
    pub fn connect(&self, peer: SocketAddr) -> Result<Arc<Connection>, ConnErr> {
        if self.is_closed() {
            return Err(ConnErr::Shutdown);
        }
        let stream = net::connect(peer, self.config.connect_timeout, &self.config.interface)
            .map_err(|e| ConnErr::Connect { peer, kind: e.kind() })?;
        Ok(self.adopt(stream, peer))
    }

    /// Connect, send, await the ack, disconnect.
    pub fn exchange(&self, peer: SocketAddr, cmd: &Command, timeout: Duration) -> Result<(), ConnErr> {
        let conn = self.connect(peer)?;
        let result = conn.request(cmd).and_then(|()| conn.wait_ack(timeout));
        self.drop_connection(&conn);
        if let Err(e) = &result {
            debug!("{:?} exchange with {} failed: {:?}", cmd.id(), peer, e);
        }
        result
    }

    /// Connect, send, disconnect. The peer's ack is not awaited.
    pub fn post(&self, peer: SocketAddr, cmd: &Command, timeout: Duration) -> Result<(), ConnErr> {
        let conn = self.connect(peer)?;
        let result = conn.send_command(cmd).and_then(|()| conn.wait_sent(timeout));
        self.drop_connection(&conn);
        result
    }

    /// Sends every target its command and awaits the acks, spread over scoped sender
    /// threads each serving a contiguous chunk of `targets`. Returns the failures.
    pub fn parallel_send_to_all<'a, F>(
        &self,
        targets: &[(Rank, SocketAddr)],
        command_for: F,
    ) -> Vec<(Rank, ConnErr)>
    where
        F: Fn(usize) -> &'a Command + Sync,
    {
        let chunks = partition(
            targets.len(),
            self.config.ranks_per_sender_thread,
            self.config.max_sender_threads,
        );
        let timeout = self.config.op_timeout;
        let failures = Mutex::new(Vec::new());
        let scoped = crossbeam_utils::thread::scope(|s| {
            for chunk in chunks {
                let (failures, command_for) = (&failures, &command_for);
                s.spawn(move |_| {
                    for i in chunk {
                        let (rank, addr) = targets[i];
                        if let Err(e) = self.exchange(addr, command_for(i), timeout) {
                            failures.lock().push((rank, e));
                        }
                    }
                });
            }
        });
        if scoped.is_err() {
            error!("a fan-out sender thread panicked");
        }
        let failures = failures.into_inner();
        for (rank, e) in failures.iter() {
            error!("fan-out to rank {} failed: {:?}", rank, e);
        }
        failures
    }

    /// Graceful: the peer gets an ack, then the connection is torn down.
    pub fn close_connection(&self, conn: &Arc<Connection>) {
        if let Err(e) = conn.begin_close() {
            trace!("close of {} degraded to drop: {:?}", conn.peer_addr(), e);
            self.drop_connection(conn);
        }
    }

    /// Abrupt: torn down now, pending I/O abandoned, no ack.
    pub fn drop_connection(&self, conn: &Arc<Connection>) {
        self.connections.lock().remove(&conn.token());
        conn.teardown();
    }

    fn connection(&self, token: Token) -> Option<Arc<Connection>> {
        self.connections.lock().get(&token).cloned()
    }

    pub(crate) fn finish_close(&self, token: Token) {
        if let Some(conn) = self.connections.lock().remove(&token) {
            conn.teardown();
            trace!("closed connection with {}", conn.peer_addr());
        }
    }

    pub(crate) fn connection_failed(&self, token: Token, err: EndpointErr) {
        if let (Some(me), Some(conn)) = (self.me.upgrade(), self.connection(token)) {
            self.handler.on_error(&me, &conn, err);
        }
    }

    pub(crate) fn dispatch_command(&self, token: Token, cmd: Command) {
        if let (Some(me), Some(conn)) = (self.me.upgrade(), self.connection(token)) {
            trace!("{:?} from {}", cmd.id(), conn.peer_addr());
            self.handler.on_command(&me, &conn, cmd);
        }
    }

    /// Stops the reactor and tears down every connection. Idempotent.
    /// Must not be called from a reactor thread.
    pub fn shutdown(&self) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        self.reactor.close();
        let conns: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.teardown();
        }
        debug!("coordinator on {} shut down", self.local_addr);
    }
}

impl SocketNotify for Coordinator {
    fn on_accept(&self, _listener: Token, stream: TcpStream, peer: SocketAddr) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            trace!("nodelay for {}: {}", peer, e);
        }
        let conn = self.adopt(stream, peer);
        if let Some(me) = self.me.upgrade() {
            self.handler.on_connect(&me, &conn);
        }
    }

    fn on_error(&self, _token: Token, err: std::io::ErrorKind) {
        warn!("listener on {} reported {:?}", self.local_addr, err);
    }

    fn on_disconnect(&self, token: Token) {
        let conn = self.connections.lock().remove(&token);
        if let Some(conn) = conn {
            debug!("peer {} disconnected", conn.peer_addr());
            conn.teardown();
            if let Some(me) = self.me.upgrade() {
                self.handler.on_disconnect(&me, conn.peer_addr());
            }
        }
    }
}

impl Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
