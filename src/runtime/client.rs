use crate::common::*;
use crate::config::HlcpConfig;
use crate::protocol::{
    types::{
        CountersAggregate, LogLevel, NicState, RankCounters, RankInfoHeader,
        RemoteDeviceConnectionInfo, SyncKind,
    },
    Command, CommandId, Rank, SERVER_RANK,
};
use crate::runtime::{
    connection::Connection,
    coordinator::{Coordinator, HlcpNotify},
    errors::ClientErr,
    ClientPhase, MigrationCallback,
};
use crate::sync::Monitor;
use std::net::Ipv6Addr;

// Whatever the server and peers delivered, awaiting collection by the rank's own calls.
#[derive(Debug, Default)]
struct ClientData {
    comm_data: Option<Vec<RankInfoHeader>>,
    qps: Option<Vec<Payload>>,
    non_peers: HashMap<Rank, Payload>,
    non_peer_dup: Option<Rank>,
    server_syncs: usize,
    peer_syncs: HashMap<Rank, usize>,
    counters: Option<CountersAggregate>,
    failed_ports: u64,
    fatal: Option<String>,
}

struct ClientCore {
    rank: Rank,
    data: Monitor<ClientData>,
    callback: Mutex<Option<Arc<dyn MigrationCallback>>>,
}

/// One rank's side of the coordination protocol.
///
/// Bootstrap runs `exchange_rank_data` then `exchange_qps_conf`; the remaining
/// operations need the rank table the first of these returns. Every blocking wait is
/// bounded by the configured operation timeout.
pub struct HlcpClient {
    rank: Rank,
    comm_size: u32,
    server: SocketAddr,
    timeout: Duration,
    coord: Arc<Coordinator>,
    core: Arc<ClientCore>,
    phase: Mutex<ClientPhase>,
    table: Mutex<Vec<RankInfoHeader>>,
}

///////////////////// IMPL /////////////////////

impl ClientCore {
    fn record(&self, conn_peer: SocketAddr, cmd: Command) -> Result<Option<NicState>, Command> {
        let mut data = self.data.lock();
        match cmd {
            Command::CommData { table, .. } => data.comm_data = Some(table),
            Command::QpsConf { blobs, .. } => data.qps = Some(blobs),
            Command::NonPeers { rank, blob } => {
                if data.non_peers.contains_key(&rank) {
                    error!("rank {}: second non-peer blob from rank {} ({})", self.rank, rank, conn_peer);
                    data.non_peer_dup = Some(rank);
                    return Err(Command::NonPeers { rank, blob });
                }
                data.non_peers.insert(rank, blob);
            }
            Command::Sync { rank, .. } if rank == SERVER_RANK => data.server_syncs += 1,
            Command::Sync { rank, .. } => *data.peer_syncs.entry(rank).or_default() += 1,
            Command::CountersData { all_reached, counters, .. } => {
                data.counters = Some(CountersAggregate { all_reached, counters })
            }
            Command::NicState(ns) => {
                let bit = 1u64 << ns.nic.min(63);
                if ns.up {
                    data.failed_ports &= !bit;
                } else {
                    data.failed_ports |= bit;
                }
                return Ok(Some(ns));
            }
            Command::LogMsg { level: LogLevel::Critical, text, .. } => {
                error!("rank {}: group failure reported by the server: {}", self.rank, text);
                data.fatal = Some(text);
            }
            Command::LogMsg { rank, level, text, .. } => {
                log::log!(level.as_log_level(), "rank {}: from rank {}: {}", self.rank, rank, text);
            }
            other @ Command::RankData { .. } => return Err(other),
        }
        Ok(None)
    }
}

impl HlcpNotify for ClientCore {
    fn on_command(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>, cmd: Command) {
        let recorded = self.record(conn.peer_addr(), cmd);
        // waiters re-check only after the lock is gone
        self.data.notify_all();
        match recorded {
            Err(cmd) => {
                warn!("rank {}: rejecting {:?} from {}", self.rank, cmd.id(), conn.peer_addr());
                coord.drop_connection(conn);
            }
            Ok(nic) => {
                // acked only after the callback, so the server cannot overtake it
                if let Some(ns) = nic {
                    let callback = self.callback.lock().clone();
                    if let Some(callback) = callback {
                        callback.nic_state_change(&ns);
                    }
                }
                coord.close_connection(conn);
            }
        }
    }
}

impl HlcpClient {
    /// Starts the rank's listener and reactor. `server` is where the coordination
    /// server listens; nothing is sent yet.
    pub fn start(config: &HlcpConfig, server: SocketAddr, rank: Rank, comm_size: u32) -> Result<Self, ClientErr> {
        assert!(rank < comm_size, "rank {} out of range for a comm of {}", rank, comm_size);
        let core = Arc::new(ClientCore { rank, data: Default::default(), callback: Mutex::new(None) });
        let any = match server {
            SocketAddr::V4(_) => IpAddr::from([0, 0, 0, 0]),
            SocketAddr::V6(_) => IpAddr::from(Ipv6Addr::UNSPECIFIED),
        };
        let handler: Arc<dyn HlcpNotify> = core.clone();
        let coord = Coordinator::start(config, config.client_io_threads, SocketAddr::new(any, 0), handler)?;
        debug!("rank {} of {} listening on {}", rank, comm_size, coord.local_addr());
        Ok(Self {
            rank,
            comm_size,
            server,
            timeout: config.op_timeout,
            coord,
            core,
            phase: Mutex::new(ClientPhase::CommData),
            table: Mutex::new(vec![]),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }
    pub fn comm_size(&self) -> u32 {
        self.comm_size
    }
    pub fn phase(&self) -> ClientPhase {
        *self.phase.lock()
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.coord.local_addr()
    }

    /// Scale-out ports currently failed somewhere in the group, as the server reported them.
    pub fn failed_scaleout_ports(&self) -> u64 {
        self.core.data.lock().failed_ports
    }

    pub fn set_migration_callback(&self, callback: Arc<dyn MigrationCallback>) {
        *self.core.callback.lock() = Some(callback);
    }

    fn expect_phase(&self, expected: ClientPhase) -> Result<(), ClientErr> {
        let actual = self.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(ClientErr::WrongPhase { expected, actual })
        }
    }

    fn set_phase(&self, phase: ClientPhase) {
        *self.phase.lock() = phase;
        debug!("rank {} entered {:?}", self.rank, phase);
    }

    // blocks until `f` yields, the server reports a group failure, or the timeout
    fn await_data<R>(
        &self,
        cmd: CommandId,
        mut f: impl FnMut(&mut ClientData) -> Option<Result<R, ClientErr>>,
    ) -> Result<R, ClientErr> {
        let got = await_or!(self.core.data, self.timeout, ClientErr::Timeout(cmd), |d: &mut ClientData| {
            if let Some(text) = &d.fatal {
                return Some(Err(ClientErr::Fatal(text.clone())));
            }
            f(d)
        });
        if let Err(e) = &got {
            debug!("rank {}: {:?} failed: {:?}", self.rank, cmd, e);
        }
        got
    }

    fn to_server(&self, cmd: &Command) -> Result<(), ClientErr> {
        Ok(self.coord.exchange(self.server, cmd, self.timeout)?)
    }

    fn rank_addr(&self, rank: Rank) -> Result<SocketAddr, ClientErr> {
        let table = self.table.lock();
        table.get(rank as usize).map(|h| h.caddr).ok_or(ClientErr::UnknownRank(rank))
    }

    fn rank_targets(&self, ranks: &[Rank]) -> Result<Vec<(Rank, SocketAddr)>, ClientErr> {
        if self.phase() == ClientPhase::CommData {
            return Err(ClientErr::WrongPhase { expected: ClientPhase::QpsConf, actual: ClientPhase::CommData });
        }
        ranks
            .iter()
            .map(|&r| {
                assert_ne!(r, self.rank, "rank {} listed itself as a remote rank", r);
                Ok((r, self.rank_addr(r)?))
            })
            .collect()
    }

    // first failure of a fan-out, if any
    fn send_to_ranks<'a>(
        &self,
        targets: &[(Rank, SocketAddr)],
        command_for: impl Fn(usize) -> &'a Command + Sync,
    ) -> Result<(), ClientErr> {
        match self.coord.parallel_send_to_all(targets, command_for).into_iter().next() {
            Some((_, e)) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Sends this rank's header and returns the group's rank table, indexed by rank.
    /// `caddr` of every entry is where that rank's client listens.
    pub fn exchange_rank_data(&self, mut header: RankInfoHeader) -> Result<Vec<RankInfoHeader>, ClientErr> {
        self.expect_phase(ClientPhase::CommData)?;
        header.hccl_rank = self.rank;
        let listen_port = self.local_addr().port();
        header.caddr = SocketAddr::new(header.caddr.ip(), listen_port);
        self.core.data.lock().comm_data = None;
        self.to_server(&Command::RankData { comm_size: self.comm_size, listen_port, header })?;
        let n = self.comm_size as usize;
        let table = self.await_data(CommandId::CommData, |d| {
            let table = d.comm_data.take()?;
            if table.len() == n {
                Some(Ok(table))
            } else {
                Some(Err(ClientErr::RowSizeMismatch { expected: n, got: table.len() }))
            }
        })?;
        *self.table.lock() = table.clone();
        self.set_phase(ClientPhase::QpsConf);
        Ok(table)
    }

    /// `row[j]` is what rank `j` needs from this rank. Returns the column addressed to
    /// this rank: element `j` came from rank `j`.
    pub fn exchange_qps_conf_raw(&self, row: Vec<Payload>) -> Result<Vec<Payload>, ClientErr> {
        self.expect_phase(ClientPhase::QpsConf)?;
        let n = self.comm_size as usize;
        if row.len() != n {
            return Err(ClientErr::RowSizeMismatch { expected: n, got: row.len() });
        }
        self.core.data.lock().qps = None;
        self.to_server(&Command::QpsConf { rank: self.rank, comm_size: self.comm_size, blobs: row })?;
        let column = self.await_data(CommandId::QpsConf, |d| {
            let column = d.qps.take()?;
            if column.len() == n {
                Some(Ok(column))
            } else {
                Some(Err(ClientErr::RowSizeMismatch { expected: n, got: column.len() }))
            }
        })?;
        self.set_phase(ClientPhase::ConfDone);
        Ok(column)
    }

    pub fn exchange_qps_conf(
        &self,
        row: &[RemoteDeviceConnectionInfo],
    ) -> Result<Vec<RemoteDeviceConnectionInfo>, ClientErr> {
        let blobs = row.iter().map(RemoteDeviceConnectionInfo::to_blob).collect();
        let column = self.exchange_qps_conf_raw(blobs)?;
        column.iter().map(|blob| Ok(RemoteDeviceConnectionInfo::from_blob(blob)?)).collect()
    }

    /// Exchanges blobs directly with `remote_ranks`, bypassing the server. Returns what
    /// every one of them sent this rank.
    pub fn exchange_non_peers(
        &self,
        remote_ranks: &[Rank],
        blob_for: impl Fn(Rank) -> Payload,
    ) -> Result<HashMap<Rank, Payload>, ClientErr> {
        let targets = self.rank_targets(remote_ranks)?;
        let cmds: Vec<Command> =
            targets.iter().map(|&(r, _)| Command::NonPeers { rank: self.rank, blob: blob_for(r) }).collect();
        self.send_to_ranks(&targets, |i| &cmds[i])?;
        self.await_data(CommandId::NonPeers, |d| {
            if let Some(r) = d.non_peer_dup.take() {
                return Some(Err(ClientErr::DuplicateNonPeer(r)));
            }
            if !remote_ranks.iter().all(|r| d.non_peers.contains_key(r)) {
                return None;
            }
            let got = remote_ranks.iter().filter_map(|r| Some((*r, d.non_peers.remove(r)?))).collect();
            Some(Ok(got))
        })
    }

    /// Blocks until every rank of the group called `rendezvous`.
    pub fn rendezvous(&self, kind: SyncKind) -> Result<(), ClientErr> {
        self.expect_phase(ClientPhase::ConfDone)?;
        self.to_server(&Command::Sync { rank: self.rank, kind })?;
        self.await_data(CommandId::Sync, |d| {
            if d.server_syncs == 0 {
                return None;
            }
            d.server_syncs -= 1;
            Some(Ok(()))
        })?;
        trace!("rank {} released from {:?}", self.rank, kind);
        Ok(())
    }

    /// A barrier among `remote_ranks` and this rank, without the server.
    pub fn sync_between_ranks(&self, remote_ranks: &[Rank]) -> Result<(), ClientErr> {
        let targets = self.rank_targets(remote_ranks)?;
        let cmd = Command::Sync { rank: self.rank, kind: SyncKind::Rendezvous };
        self.send_to_ranks(&targets, |_| &cmd)?;
        self.await_data(CommandId::Sync, |d| {
            let arrived = remote_ranks.iter().all(|r| d.peer_syncs.get(r).map_or(false, |&n| n > 0));
            if !arrived {
                return None;
            }
            for r in remote_ranks {
                if let Some(n) = d.peer_syncs.get_mut(r) {
                    *n -= 1;
                }
            }
            Some(Ok(()))
        })
    }

    /// Reports this rank's counters and returns the server's verdict over all ranks.
    pub fn exchange_counters(&self, mut counters: RankCounters) -> Result<CountersAggregate, ClientErr> {
        self.expect_phase(ClientPhase::ConfDone)?;
        counters.rank = self.rank;
        let cmd = Command::CountersData {
            rank: self.rank,
            comm_size: self.comm_size,
            all_reached: counters.reached,
            counters: vec![counters],
        };
        self.core.data.lock().counters = None;
        self.to_server(&cmd)?;
        self.await_data(CommandId::CountersData, |d| d.counters.take().map(Ok))
    }

    /// Tells the server one of this rank's scale-out ports changed state.
    pub fn report_nic_state(&self, nic: u32, up: bool) -> Result<(), ClientErr> {
        self.expect_phase(ClientPhase::ConfDone)?;
        self.to_server(&Command::NicState(NicState { rank: self.rank, nic, up }))
    }

    fn send_log(&self, level: LogLevel, text: &str) {
        let cmd = Command::LogMsg { rank: self.rank, level, timestamp_us: now_us(), text: text.to_owned() };
        if let Err(e) = self.coord.post(self.server, &cmd, self.timeout) {
            warn!("rank {}: collective log not delivered: {:?}", self.rank, e);
        }
    }

    /// Relays `text` to the server's collective log. Delivery is not confirmed.
    pub fn send_collective_log(&self, text: &str) {
        self.send_log(LogLevel::Info, text)
    }

    pub fn send_collective_log_err(&self, text: &str) {
        self.send_log(LogLevel::Error, text)
    }

    /// Forgets the bootstrap so it can run again, e.g. after a group re-forms.
    pub fn reset(&self) {
        *self.core.data.lock() = ClientData::default();
        self.table.lock().clear();
        self.set_phase(ClientPhase::CommData);
    }

    /// Stops the listener and reactor. Idempotent.
    pub fn shutdown(&self) {
        self.coord.shutdown();
    }
}

impl Drop for HlcpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for HlcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HlcpClient")
            .field("rank", &self.rank)
            .field("comm_size", &self.comm_size)
            .field("server", &self.server)
            .field("phase", &self.phase())
            .finish()
    }
}
