use crate::common::*;
use crate::config::HlcpConfig;
use crate::protocol::{types::UniqueId, Rank};
use crate::runtime::{
    errors::{ClientErr, StartErr},
    CommId, HlcpClient, HlcpServer,
};

/// Owns the coordination objects of one process: at most one server (on the rank that
/// created the unique id) and one client per communicator.
#[derive(Debug)]
pub struct CoordContext {
    config: HlcpConfig,
    server: Mutex<Option<HlcpServer>>,
    clients: Mutex<HashMap<CommId, Arc<HlcpClient>>>,
    next_comm: Mutex<CommId>,
}

impl CoordContext {
    pub fn new(config: HlcpConfig) -> Self {
        Self { config, server: Mutex::new(None), clients: Default::default(), next_comm: Mutex::new(0) }
    }

    pub fn config(&self) -> &HlcpConfig {
        &self.config
    }

    /// Starts this process's coordination server on `bind` and returns the id every
    /// rank needs to reach it.
    pub fn create_unique_id(&self, bind: SocketAddr) -> Result<UniqueId, StartErr> {
        let mut server = self.server.lock();
        if server.is_some() {
            return Err(StartErr::AlreadyStarted);
        }
        let started = HlcpServer::start(&self.config, bind)?;
        let mut addr = started.local_addr();
        if addr.ip().is_unspecified() && !bind.ip().is_unspecified() {
            addr.set_ip(bind.ip());
        }
        *server = Some(started);
        Ok(UniqueId::from_addr(addr))
    }

    /// A client for `rank` of a new communicator served by the server behind `id`.
    pub fn create_client(&self, id: &UniqueId, rank: Rank, comm_size: u32) -> Result<CommId, ClientErr> {
        let server = id.addr().ok_or(ClientErr::Start(StartErr::InvalidUniqueId))?;
        let client = Arc::new(HlcpClient::start(&self.config, server, rank, comm_size)?);
        let comm = {
            let mut next = self.next_comm.lock();
            let comm = *next;
            *next += 1;
            comm
        };
        self.clients.lock().insert(comm, client);
        debug!("comm {}: rank {} of {} served by {}", comm, rank, comm_size, server);
        Ok(comm)
    }

    pub fn client(&self, comm: CommId) -> Option<Arc<HlcpClient>> {
        self.clients.lock().get(&comm).cloned()
    }

    /// Shuts the communicator's client down. False if `comm` is unknown.
    pub fn destroy_comm(&self, comm: CommId) -> bool {
        let client = self.clients.lock().remove(&comm);
        match client {
            Some(client) => {
                client.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shuts down every client, then the server.
    pub fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.shutdown();
        }
        if let Some(mut server) = self.server.lock().take() {
            server.shutdown();
        }
    }
}

impl Drop for CoordContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
