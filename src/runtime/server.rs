use crate::common::*;
use crate::config::HlcpConfig;
use crate::protocol::{
    types::{
        CountersAggregate, LogLevel, NicState, RankCounters, RankInfoHeader, SyncKind,
        MAX_SCALEOUT_PORTS,
    },
    Command, CommandId, Rank, SERVER_RANK,
};
use crate::runtime::{
    connection::Connection,
    coordinator::{Coordinator, HlcpNotify},
    errors::{ServerErr, StartErr},
    GroupState,
};
use crate::sync::{DelayedCall, WaitQueue};
use std::thread::JoinHandle;

/// Log target of telemetry relayed from ranks.
pub const COLL_LOG_TARGET: &str = "hlcp::coll";

/// What to send once a phase completes.
#[derive(Debug)]
pub(crate) struct Fanout {
    pub targets: Vec<(Rank, SocketAddr)>,
    pub body: FanoutBody,
}

#[derive(Debug)]
pub(crate) enum FanoutBody {
    Broadcast(Command),
    /// Indexed like `targets`
    PerRank(Vec<Command>),
}

/// The aggregation tables of one comm. Holds no sockets: every decision the
/// server makes is a function of the commands applied here.
#[derive(Debug)]
pub(crate) struct ServerState {
    state: GroupState,
    max_comm_size: u32,
    comm_size: u32,
    ranks: Vec<Option<RankInfoHeader>>,
    qps: Vec<Option<Vec<Payload>>>,
    syncs: Vec<Option<SyncKind>>,
    counters: Vec<Option<RankCounters>>,
    // logical port -> ranks currently reporting it failed, in report order
    failed_ports: IndexMap<u32, IndexSet<Rank>>,
}

#[derive(Debug)]
struct CollLog {
    peer: SocketAddr,
    rank: Rank,
    level: LogLevel,
    timestamp_us: u64,
    text: String,
}

struct ServerCore {
    me: Weak<ServerCore>,
    config: HlcpConfig,
    state: Mutex<ServerState>,
    logs: Arc<WaitQueue<Option<CollLog>>>,
    // drained by the fan-out worker in push order
    fanouts: Arc<WaitQueue<Option<Fanout>>>,
    stragglers: Mutex<HashMap<CommandId, DelayedCall>>,
}

/// The coordination server of one group of ranks.
pub struct HlcpServer {
    core: Arc<ServerCore>,
    coord: Arc<Coordinator>,
    fanout: Option<JoinHandle<()>>,
    logger: Option<JoinHandle<()>>,
}

///////////////////// IMPL /////////////////////

impl Fanout {
    pub fn command_for(&self, i: usize) -> &Command {
        match &self.body {
            FanoutBody::Broadcast(cmd) => cmd,
            FanoutBody::PerRank(cmds) => &cmds[i],
        }
    }
    pub fn id(&self) -> Option<CommandId> {
        match &self.body {
            FanoutBody::Broadcast(cmd) => Some(cmd.id()),
            FanoutBody::PerRank(cmds) => cmds.first().map(Command::id),
        }
    }
}

impl ServerState {
    /// An empty table that refuses to form comms larger than `max_comm_size`.
    pub fn new(max_comm_size: u32) -> Self {
        Self {
            state: GroupState::Inactive,
            max_comm_size,
            comm_size: 0,
            ranks: vec![],
            qps: vec![],
            syncs: vec![],
            counters: vec![],
            failed_ports: IndexMap::default(),
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }
    pub fn comm_size(&self) -> u32 {
        self.comm_size
    }

    /// The rank table as delivered so far, caddr completed.
    pub fn rank_info(&self, rank: Rank) -> Option<&RankInfoHeader> {
        self.ranks.get(rank as usize)?.as_ref()
    }

    fn reset(&mut self, comm_size: u32) {
        let n = comm_size as usize;
        self.comm_size = comm_size;
        self.ranks = vec![None; n];
        self.qps = vec![None; n];
        self.syncs = vec![None; n];
        self.counters = vec![None; n];
        self.failed_ports.clear();
    }

    fn slots(&self, phase: CommandId) -> Option<Vec<bool>> {
        Some(match phase {
            CommandId::RankData => self.ranks.iter().map(Option::is_some).collect(),
            CommandId::QpsConf => self.qps.iter().map(Option::is_some).collect(),
            CommandId::Sync => self.syncs.iter().map(Option::is_some).collect(),
            CommandId::CountersData => self.counters.iter().map(Option::is_some).collect(),
            _ => return None,
        })
    }

    /// Ranks whose command for `phase` has arrived. Zero for non-phase commands.
    pub fn delivered(&self, phase: CommandId) -> usize {
        self.slots(phase).map(|s| s.into_iter().filter(|&d| d).count()).unwrap_or(0)
    }

    /// Ranks that have not yet delivered `phase`.
    pub fn missing(&self, phase: CommandId) -> Vec<Rank> {
        let slots = self.slots(phase).unwrap_or_default();
        slots.into_iter().enumerate().filter(|(_, d)| !d).map(|(r, _)| r as Rank).collect()
    }

    /// The ranks still missing from a phase under way. `None` before its first
    /// delivery and after it completed.
    pub fn stragglers(&self, phase: CommandId) -> Option<Vec<Rank>> {
        if self.delivered(phase) == 0 {
            return None;
        }
        Some(self.missing(phase)).filter(|missing| !missing.is_empty())
    }

    /// Applies one inbound command. `Ok(Some(_))` IFF it completed a phase (or
    /// changed a port's aggregate state) and something must be sent to every rank.
    pub fn apply(&mut self, cmd: Command, peer: SocketAddr) -> Result<Option<Fanout>, ServerErr> {
        match cmd {
            Command::RankData { comm_size, listen_port, header } => {
                self.rank_data(comm_size, listen_port, header, peer)
            }
            Command::QpsConf { rank, comm_size, blobs } => self.qps_conf(rank, comm_size, blobs),
            Command::Sync { rank, kind } => self.sync(rank, kind),
            Command::CountersData { rank, comm_size, counters, .. } => {
                self.counters_data(rank, comm_size, counters)
            }
            Command::NicState(ns) => self.nic_state(ns),
            other => Err(ServerErr::Unexpected(other.id())),
        }
    }

    fn check_rank(&self, rank: Rank) -> Result<usize, ServerErr> {
        if rank < self.comm_size {
            Ok(rank as usize)
        } else {
            Err(ServerErr::RankOutOfRange(rank))
        }
    }

    fn check_comm_size(&self, comm_size: u32) -> Result<(), ServerErr> {
        if comm_size == self.comm_size {
            Ok(())
        } else {
            Err(ServerErr::CommSizeMismatch { expected: self.comm_size, got: comm_size })
        }
    }

    // the phase needs the complete rank table to know where to fan out
    fn require_table(&self, cmd: CommandId) -> Result<(), ServerErr> {
        if self.state != GroupState::Inactive && self.ranks.iter().all(Option::is_some) {
            Ok(())
        } else {
            Err(ServerErr::NotActive(cmd))
        }
    }

    fn targets(&self) -> Vec<(Rank, SocketAddr)> {
        self.ranks.iter().flatten().map(|h| (h.hccl_rank, h.caddr)).collect()
    }

    fn broadcast(&self, cmd: Command) -> Option<Fanout> {
        Some(Fanout { targets: self.targets(), body: FanoutBody::Broadcast(cmd) })
    }

    fn rank_data(
        &mut self,
        comm_size: u32,
        listen_port: u16,
        mut header: RankInfoHeader,
        peer: SocketAddr,
    ) -> Result<Option<Fanout>, ServerErr> {
        // nothing may be reset before the command is known to be acceptable
        if comm_size == 0 || comm_size > self.max_comm_size {
            return Err(ServerErr::InvalidCommSize(comm_size));
        }
        if header.hccl_rank >= comm_size {
            return Err(ServerErr::RankOutOfRange(header.hccl_rank));
        }
        if self.state != GroupState::Active {
            info!("forming a comm of {} ranks (was {:?})", comm_size, self.state);
            self.reset(comm_size);
            self.state = GroupState::Active;
        } else {
            self.check_comm_size(comm_size)?;
        }
        let r = header.hccl_rank as usize;
        if self.ranks[r].is_some() {
            return Err(ServerErr::Duplicate { cmd: CommandId::RankData, rank: header.hccl_rank });
        }
        let ip = if header.caddr.ip().is_unspecified() { peer.ip() } else { header.caddr.ip() };
        header.caddr = SocketAddr::new(ip, listen_port);
        debug!("rank {} of {} reachable at {}", r, comm_size, header.caddr);
        self.ranks[r] = Some(header);
        if self.ranks.iter().any(Option::is_none) {
            return Ok(None);
        }
        let table: Vec<RankInfoHeader> = self.ranks.iter().flatten().cloned().collect();
        if let Err(text) = check_boxes(&table) {
            error!("{}", text);
            let level = LogLevel::Critical;
            return Ok(self.broadcast(Command::LogMsg { rank: SERVER_RANK, level, timestamp_us: now_us(), text }));
        }
        info!("all {} ranks delivered their headers", comm_size);
        Ok(self.broadcast(Command::CommData { comm_size, table }))
    }

    fn qps_conf(&mut self, rank: Rank, comm_size: u32, blobs: Vec<Payload>) -> Result<Option<Fanout>, ServerErr> {
        self.require_table(CommandId::QpsConf)?;
        self.check_comm_size(comm_size)?;
        let r = self.check_rank(rank)?;
        if blobs.len() != self.comm_size as usize {
            return Err(ServerErr::RowSizeMismatch { rank, expected: self.comm_size as usize, got: blobs.len() });
        }
        if self.qps[r].is_some() {
            return Err(ServerErr::Duplicate { cmd: CommandId::QpsConf, rank });
        }
        self.qps[r] = Some(blobs);
        if self.qps.iter().any(Option::is_none) {
            return Ok(None);
        }
        // transpose: rank r receives what every rank j prepared for r
        let n = self.comm_size as usize;
        let mut columns: Vec<Vec<Payload>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        for row in self.qps.iter_mut().map(|row| row.take().unwrap_or_default()) {
            for (r, blob) in row.into_iter().enumerate() {
                columns[r].push(blob);
            }
        }
        info!("all {} ranks delivered their connection rows", n);
        let targets = self.targets();
        let cmds = targets
            .iter()
            .map(|&(r, _)| Command::QpsConf {
                rank: r,
                comm_size,
                blobs: std::mem::take(&mut columns[r as usize]),
            })
            .collect();
        Ok(Some(Fanout { targets, body: FanoutBody::PerRank(cmds) }))
    }

    fn sync(&mut self, rank: Rank, kind: SyncKind) -> Result<Option<Fanout>, ServerErr> {
        self.require_table(CommandId::Sync)?;
        let r = self.check_rank(rank)?;
        if self.syncs[r].is_some() {
            return Err(ServerErr::Duplicate { cmd: CommandId::Sync, rank });
        }
        self.syncs[r] = Some(kind);
        if self.syncs.iter().any(Option::is_none) {
            return Ok(None);
        }
        let kinds: Vec<SyncKind> = self.syncs.iter_mut().filter_map(Option::take).collect();
        let kind = if kinds.contains(&SyncKind::MigrationDone) {
            info!("all ranks completed the migration cycle");
            SyncKind::MigrationDone
        } else {
            info!("all ranks reached the rendezvous");
            SyncKind::Rendezvous
        };
        self.state = GroupState::Operational;
        Ok(self.broadcast(Command::Sync { rank: SERVER_RANK, kind }))
    }

    fn counters_data(
        &mut self,
        rank: Rank,
        comm_size: u32,
        mut counters: Vec<RankCounters>,
    ) -> Result<Option<Fanout>, ServerErr> {
        self.require_table(CommandId::CountersData)?;
        self.check_comm_size(comm_size)?;
        let r = self.check_rank(rank)?;
        if counters.len() != 1 {
            return Err(ServerErr::RowSizeMismatch { rank, expected: 1, got: counters.len() });
        }
        let own = counters.remove(0);
        if own.rank != rank {
            return Err(ServerErr::RankOutOfRange(own.rank));
        }
        let n = self.comm_size as usize;
        for len in [own.sent.len(), own.observed.len()].iter().copied() {
            if len != n {
                return Err(ServerErr::RowSizeMismatch { rank, expected: n, got: len });
            }
        }
        if self.counters[r].is_some() {
            return Err(ServerErr::Duplicate { cmd: CommandId::CountersData, rank });
        }
        self.counters[r] = Some(own);
        if self.counters.iter().any(Option::is_none) {
            return Ok(None);
        }
        let all: Vec<RankCounters> = self.counters.iter_mut().filter_map(Option::take).collect();
        let CountersAggregate { all_reached, counters } = CountersAggregate::evaluate(all);
        debug!("counters of {} ranks aggregated; all reached: {}", n, all_reached);
        Ok(self.broadcast(Command::CountersData { rank: SERVER_RANK, comm_size, all_reached, counters }))
    }

    fn nic_state(&mut self, ns: NicState) -> Result<Option<Fanout>, ServerErr> {
        self.require_table(CommandId::NicState)?;
        let r = self.check_rank(ns.rank)?;
        if ns.nic >= MAX_SCALEOUT_PORTS {
            return Err(ServerErr::PortOutOfRange(ns.nic));
        }
        let failed = self.failed_ports.entry(ns.nic).or_insert_with(IndexSet::new);
        // only the first failure and the last recovery of a port are news
        let changed = if ns.up {
            failed.swap_remove(&ns.rank) && failed.is_empty()
        } else {
            failed.insert(ns.rank) && failed.len() == 1
        };
        if let Some(header) = self.ranks[r].as_mut() {
            let bit = 1u64 << ns.nic;
            if ns.up {
                header.failed_scaleout_ports &= !bit;
            } else {
                header.failed_scaleout_ports |= bit;
            }
        }
        if !changed {
            trace!("port {} of rank {} up={}: no aggregate change", ns.nic, ns.rank, ns.up);
            return Ok(None);
        }
        if ns.up {
            info!("scale-out port {} recovered on every rank", ns.nic);
        } else {
            warn!("scale-out port {} failed (first reported by rank {})", ns.nic, ns.rank);
        }
        Ok(self.broadcast(Command::NicState(ns)))
    }
}

// every rank of a box must agree on the box size and the addressing mode
fn check_boxes(table: &[RankInfoHeader]) -> Result<(), String> {
    let mut boxes: HashMap<&str, &RankInfoHeader> = HashMap::default();
    for h in table {
        let first = *boxes.entry(h.hostname.as_str()).or_insert(h);
        if first.box_size != h.box_size {
            return Err(format!(
                "box {}: rank {} reports box size {} but rank {} reports {}",
                h.hostname, first.hccl_rank, first.box_size, h.hccl_rank, h.box_size
            ));
        }
        if first.ip_addressing != h.ip_addressing {
            return Err(format!(
                "box {}: ranks {} and {} disagree on IP addressing",
                h.hostname, first.hccl_rank, h.hccl_rank
            ));
        }
    }
    Ok(())
}

impl ServerCore {
    // called with the state locked
    fn arm_straggler_report(&self, phase: CommandId) {
        let me = self.me.clone();
        let delay = self.config.straggler_report_delay;
        let call = DelayedCall::start(delay, move || {
            if let Some(core) = me.upgrade() {
                let stragglers = core.state.lock().stragglers(phase);
                if let Some(missing) = stragglers {
                    warn!("{:?}: still waiting for ranks {:?} after {:?}", phase, missing, delay);
                }
            }
        });
        let replaced = self.stragglers.lock().insert(phase, call);
        if let Some(old) = replaced {
            old.cancel();
        }
    }

    fn cancel_straggler_report(&self, phase: CommandId) {
        let call = self.stragglers.lock().remove(&phase);
        if let Some(call) = call {
            call.cancel();
        }
    }

    fn relay_log(&self, peer: SocketAddr, rank: Rank, level: LogLevel, timestamp_us: u64, text: String) {
        self.logs.push(Some(CollLog { peer, rank, level, timestamp_us, text }));
    }
}

impl HlcpNotify for ServerCore {
    fn on_command(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>, cmd: Command) {
        let peer = conn.peer_addr();
        if let Command::LogMsg { rank, level, timestamp_us, text } = cmd {
            self.relay_log(peer, rank, level, timestamp_us, text);
            coord.close_connection(conn);
            return;
        }
        let id = cmd.id();
        let result = {
            let mut state = self.state.lock();
            // queued and timed under the lock, in the order the state changed
            match state.apply(cmd, peer) {
                Ok(Some(fanout)) => {
                    self.cancel_straggler_report(id);
                    self.fanouts.push(Some(fanout));
                    Ok(())
                }
                Ok(None) => {
                    if state.delivered(id) == 1 {
                        self.arm_straggler_report(id);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => coord.close_connection(conn),
            Err(e) => {
                warn!("rejecting {:?} from {}: {:?}", id, peer, e);
                coord.drop_connection(conn);
            }
        }
    }
}

// One fan-out at a time, in queue order. Runs off the reactor threads: it blocks
// on acks that those threads deliver.
fn spawn_fanout_worker(
    coord: Arc<Coordinator>,
    queue: Arc<WaitQueue<Option<Fanout>>>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("hlcp-fanout".into()).spawn(move || {
        while let Some(fanout) = queue.pop() {
            if coord.is_closed() {
                debug!("discarding {:?} fan-out: server closed", fanout.id());
                continue;
            }
            let failures = coord.parallel_send_to_all(&fanout.targets, |i| fanout.command_for(i));
            if failures.is_empty() {
                debug!("{:?} fanned out to {} ranks", fanout.id(), fanout.targets.len());
            }
        }
    })
}

fn spawn_logger(queue: Arc<WaitQueue<Option<CollLog>>>) -> Option<JoinHandle<()>> {
    let spawned = std::thread::Builder::new().name("hlcp-coll-log".into()).spawn(move || {
        while let Some(entry) = queue.pop() {
            let CollLog { peer, rank, level, timestamp_us, text } = entry;
            log::log!(
                target: COLL_LOG_TARGET,
                level.as_log_level(),
                "rank {} ({}) @{}us: {}",
                rank,
                peer,
                timestamp_us,
                text
            );
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("cannot spawn the collective logger: {}", e);
            None
        }
    }
}

impl HlcpServer {
    /// Listens on `bind` (port 0 picks one; see `local_addr`).
    pub fn start(config: &HlcpConfig, bind: SocketAddr) -> Result<Self, StartErr> {
        let logs = Arc::new(WaitQueue::new());
        let fanouts = Arc::new(WaitQueue::new());
        let core = Arc::new_cyclic(|me| ServerCore {
            me: me.clone(),
            config: config.clone(),
            state: Mutex::new(ServerState::new(config.max_comm_size)),
            logs: logs.clone(),
            fanouts: fanouts.clone(),
            stragglers: Default::default(),
        });
        let handler: Arc<dyn HlcpNotify> = core.clone();
        let coord = Coordinator::start(config, config.server_io_threads, bind, handler)?;
        let fanout = match spawn_fanout_worker(coord.clone(), fanouts) {
            Ok(handle) => handle,
            Err(e) => {
                error!("cannot spawn the fan-out worker: {}", e);
                coord.shutdown();
                return Err(StartErr::Reactor(e.kind()));
            }
        };
        let logger = spawn_logger(logs);
        info!("coordination server listening on {}", coord.local_addr());
        Ok(Self { core, coord, fanout: Some(fanout), logger })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.coord.local_addr()
    }

    pub fn state(&self) -> GroupState {
        self.core.state.lock().state()
    }

    pub fn comm_size(&self) -> u32 {
        self.core.state.lock().comm_size()
    }

    /// Stops serving. Idempotent.
    pub fn shutdown(&mut self) {
        self.coord.shutdown();
        let pending: Vec<DelayedCall> = self.core.stragglers.lock().drain().map(|(_, c)| c).collect();
        for call in pending {
            call.cancel();
        }
        if let Some(fanout) = self.fanout.take() {
            self.core.fanouts.push(None);
            let _ = fanout.join();
        }
        if let Some(logger) = self.logger.take() {
            self.core.logs.push(None);
            let _ = logger.join();
        }
    }
}

impl Drop for HlcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for HlcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HlcpServer")
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .field("comm_size", &self.comm_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_COMM: u32 = 64;

    fn peer(rank: Rank) -> SocketAddr {
        SocketAddr::new(IpAddr::from([10, 0, 0, rank as u8 + 1]), 40_000)
    }

    fn rank_data(rank: Rank, comm_size: u32, hostname: &str, box_size: u32) -> Command {
        let header = RankInfoHeader::new(rank, box_size, hostname);
        Command::RankData { comm_size, listen_port: 5_000 + rank as u16, header }
    }

    // a state whose rank table is complete
    fn formed(n: u32) -> ServerState {
        let mut s = ServerState::new(MAX_COMM);
        for r in 0..n {
            let out = s.apply(rank_data(r, n, "node", n), peer(r)).unwrap();
            assert_eq!(out.is_some(), r + 1 == n);
        }
        s
    }

    #[test]
    fn rank_table_completes_caddr() {
        let mut s = ServerState::new(MAX_COMM);
        assert_eq!(s.state(), GroupState::Inactive);
        assert!(s.apply(rank_data(1, 2, "a", 2), peer(1)).unwrap().is_none());
        assert_eq!(s.state(), GroupState::Active);
        assert_eq!(s.missing(CommandId::RankData), vec![0]);
        let fanout = s.apply(rank_data(0, 2, "a", 2), peer(0)).unwrap().unwrap();
        assert_eq!(fanout.targets, vec![(0, SocketAddr::new(peer(0).ip(), 5_000)), (1, SocketAddr::new(peer(1).ip(), 5_001))]);
        assert_let![Command::CommData { comm_size: 2, table } = fanout.command_for(1) => {
            assert_eq!(table[1].caddr, SocketAddr::new(peer(1).ip(), 5_001));
        }];
    }

    #[test]
    fn explicit_caddr_ip_is_kept() {
        let mut s = ServerState::new(MAX_COMM);
        let mut header = RankInfoHeader::new(0, 1, "a");
        header.caddr = "192.168.1.9:1".parse().unwrap();
        s.apply(Command::RankData { comm_size: 1, listen_port: 77, header }, peer(0)).unwrap();
        assert_eq!(s.rank_info(0).unwrap().caddr, "192.168.1.9:77".parse().unwrap());
    }

    #[test]
    fn rank_data_rejections() {
        let mut s = ServerState::new(MAX_COMM);
        assert_eq!(s.apply(rank_data(0, 0, "a", 1), peer(0)).unwrap_err(), ServerErr::InvalidCommSize(0));
        s.apply(rank_data(0, 3, "a", 3), peer(0)).unwrap();
        assert_eq!(
            s.apply(rank_data(0, 3, "a", 3), peer(0)).unwrap_err(),
            ServerErr::Duplicate { cmd: CommandId::RankData, rank: 0 }
        );
        assert_eq!(s.apply(rank_data(3, 3, "a", 3), peer(3)).unwrap_err(), ServerErr::RankOutOfRange(3));
        assert_eq!(
            s.apply(rank_data(1, 4, "a", 3), peer(1)).unwrap_err(),
            ServerErr::CommSizeMismatch { expected: 3, got: 4 }
        );
        // rejections leave no trace
        assert_eq!(s.delivered(CommandId::RankData), 1);
    }

    #[test]
    fn rejected_rank_data_keeps_running_group() {
        let mut s = formed(2);
        s.apply(Command::Sync { rank: 0, kind: SyncKind::Rendezvous }, peer(0)).unwrap();
        s.apply(Command::Sync { rank: 1, kind: SyncKind::Rendezvous }, peer(1)).unwrap();
        assert_eq!(s.state(), GroupState::Operational);
        assert_eq!(s.apply(rank_data(9, 2, "node", 2), peer(0)).unwrap_err(), ServerErr::RankOutOfRange(9));
        assert_eq!(
            s.apply(rank_data(0, MAX_COMM + 1, "node", 2), peer(0)).unwrap_err(),
            ServerErr::InvalidCommSize(MAX_COMM + 1)
        );
        assert_eq!(s.state(), GroupState::Operational);
        assert_eq!(s.comm_size(), 2);
        assert_eq!(s.delivered(CommandId::RankData), 2);
        assert!(s.rank_info(1).is_some());
    }

    #[test]
    fn comm_size_is_bounded() {
        let mut s = ServerState::new(MAX_COMM);
        assert_eq!(
            s.apply(rank_data(0, u32::MAX, "a", 1), peer(0)).unwrap_err(),
            ServerErr::InvalidCommSize(u32::MAX)
        );
        assert_eq!(s.state(), GroupState::Inactive);
        assert!(s.apply(rank_data(0, MAX_COMM, "a", 1), peer(0)).unwrap().is_none());
        assert_eq!(s.comm_size(), MAX_COMM);
    }

    #[test]
    fn stragglers_only_while_phase_pending() {
        let mut s = formed(3);
        assert_eq!(s.stragglers(CommandId::Sync), None);
        s.apply(Command::Sync { rank: 1, kind: SyncKind::Rendezvous }, peer(1)).unwrap();
        assert_eq!(s.stragglers(CommandId::Sync), Some(vec![0, 2]));
        s.apply(Command::Sync { rank: 0, kind: SyncKind::Rendezvous }, peer(0)).unwrap();
        s.apply(Command::Sync { rank: 2, kind: SyncKind::Rendezvous }, peer(2)).unwrap();
        // completed: slots cleared, nobody is late
        assert_eq!(s.stragglers(CommandId::Sync), None);
        assert_eq!(s.stragglers(CommandId::RankData), None);
    }

    #[test]
    fn inconsistent_box_size_is_critical() {
        let mut s = ServerState::new(MAX_COMM);
        s.apply(rank_data(0, 2, "a", 2), peer(0)).unwrap();
        let fanout = s.apply(rank_data(1, 2, "a", 4), peer(1)).unwrap().unwrap();
        assert_let![Command::LogMsg { rank, level, .. } = fanout.command_for(0) => {
            assert_eq!(*rank, SERVER_RANK);
            assert_eq!(*level, LogLevel::Critical);
        }];
        assert_eq!(s.state(), GroupState::Active);
    }

    #[test]
    fn boxes_are_checked_per_hostname() {
        let mut s = ServerState::new(MAX_COMM);
        s.apply(rank_data(0, 2, "a", 1), peer(0)).unwrap();
        let fanout = s.apply(rank_data(1, 2, "b", 2), peer(1)).unwrap().unwrap();
        assert_eq!(fanout.id(), Some(CommandId::CommData));
    }

    #[test]
    fn qps_conf_needs_table() {
        let mut s = ServerState::new(MAX_COMM);
        s.apply(rank_data(0, 2, "a", 2), peer(0)).unwrap();
        let cmd = Command::QpsConf { rank: 0, comm_size: 2, blobs: vec![vec![], vec![]] };
        assert_eq!(s.apply(cmd, peer(0)).unwrap_err(), ServerErr::NotActive(CommandId::QpsConf));
    }

    #[test]
    fn qps_conf_transposes() {
        let mut s = formed(3);
        let row = |r: u8| (0..3u8).map(|j| vec![r, j]).collect::<Vec<_>>();
        assert_eq!(
            s.apply(Command::QpsConf { rank: 0, comm_size: 3, blobs: vec![vec![]] }, peer(0)).unwrap_err(),
            ServerErr::RowSizeMismatch { rank: 0, expected: 3, got: 1 }
        );
        for r in 0..3u8 {
            let out = s.apply(Command::QpsConf { rank: r as Rank, comm_size: 3, blobs: row(r) }, peer(r as Rank));
            assert_eq!(out.unwrap().is_some(), r == 2);
            if r == 0 {
                assert_eq!(
                    s.apply(Command::QpsConf { rank: 0, comm_size: 3, blobs: row(0) }, peer(0)).unwrap_err(),
                    ServerErr::Duplicate { cmd: CommandId::QpsConf, rank: 0 }
                );
            }
        }
        // slots were cleared on completion
        assert_eq!(s.delivered(CommandId::QpsConf), 0);
    }

    #[test]
    fn qps_conf_columns() {
        let mut s = formed(2);
        s.apply(Command::QpsConf { rank: 0, comm_size: 2, blobs: vec![vec![0, 0], vec![0, 1]] }, peer(0)).unwrap();
        let fanout = s
            .apply(Command::QpsConf { rank: 1, comm_size: 2, blobs: vec![vec![1, 0], vec![1, 1]] }, peer(1))
            .unwrap()
            .unwrap();
        assert_let![Command::QpsConf { rank: 1, blobs, .. } = fanout.command_for(1) => {
            assert_eq!(blobs, &vec![vec![0, 1], vec![1, 1]]);
        }];
    }

    #[test]
    fn sync_barrier_repeats() {
        let mut s = formed(2);
        for round in 0..2 {
            assert!(s.apply(Command::Sync { rank: 1, kind: SyncKind::Rendezvous }, peer(1)).unwrap().is_none());
            let kind = if round == 0 { SyncKind::Rendezvous } else { SyncKind::MigrationDone };
            let fanout = s.apply(Command::Sync { rank: 0, kind }, peer(0)).unwrap().unwrap();
            assert_eq!(s.state(), GroupState::Operational);
            assert_let![Command::Sync { rank, kind: released } = fanout.command_for(0) => {
                assert_eq!(*rank, SERVER_RANK);
                assert_eq!(*released, kind);
            }];
        }
    }

    #[test]
    fn reinit_returns_to_active() {
        let mut s = formed(1);
        s.apply(Command::Sync { rank: 0, kind: SyncKind::Rendezvous }, peer(0)).unwrap();
        assert_eq!(s.state(), GroupState::Operational);
        s.apply(rank_data(0, 2, "a", 2), peer(0)).unwrap();
        assert_eq!(s.state(), GroupState::Active);
        assert_eq!(s.comm_size(), 2);
    }

    #[test]
    fn counters_verdict() {
        let mut s = formed(2);
        let counters = |rank: Rank, sent: u64, observed: u64| {
            let mut c = RankCounters::new(rank, 2);
            c.reached = true;
            c.sent[1 - rank as usize] = sent;
            c.observed[1 - rank as usize] = observed;
            Command::CountersData { rank, comm_size: 2, all_reached: true, counters: vec![c] }
        };
        s.apply(counters(0, 3, 5), peer(0)).unwrap();
        let fanout = s.apply(counters(1, 5, 3), peer(1)).unwrap().unwrap();
        assert_let![Command::CountersData { all_reached, counters, .. } = fanout.command_for(0) => {
            assert!(*all_reached);
            assert_eq!(counters.len(), 2);
        }];
        s.apply(counters(0, 3, 5), peer(0)).unwrap();
        let fanout = s.apply(counters(1, 4, 3), peer(1)).unwrap().unwrap();
        assert_let![Command::CountersData { all_reached, .. } = fanout.command_for(1) => {
            assert!(!*all_reached);
        }];
    }

    #[test]
    fn counters_must_be_own_row() {
        let mut s = formed(2);
        let mut c = RankCounters::new(1, 2);
        c.reached = true;
        let cmd = Command::CountersData { rank: 0, comm_size: 2, all_reached: true, counters: vec![c] };
        assert_eq!(s.apply(cmd, peer(0)).unwrap_err(), ServerErr::RankOutOfRange(1));
        let short = RankCounters::new(0, 1);
        let cmd = Command::CountersData { rank: 0, comm_size: 2, all_reached: true, counters: vec![short] };
        assert_eq!(s.apply(cmd, peer(0)).unwrap_err(), ServerErr::RowSizeMismatch { rank: 0, expected: 2, got: 1 });
    }

    #[test]
    fn nic_state_debounce() {
        let mut s = formed(3);
        let mut nic = |rank: Rank, up: bool| {
            s.apply(Command::NicState(NicState { rank, nic: 5, up }), peer(rank)).unwrap().is_some()
        };
        // first failure, second failure, first recovery, last recovery
        assert!(nic(0, false));
        assert!(!nic(1, false));
        assert!(!nic(0, true));
        assert!(nic(1, true));
        // recovering a port that never failed is not news
        assert!(!nic(2, true));
    }

    #[test]
    fn nic_state_updates_rank_mask() {
        let mut s = formed(2);
        s.apply(Command::NicState(NicState { rank: 1, nic: 3, up: false }), peer(1)).unwrap();
        assert_eq!(s.rank_info(1).unwrap().failed_scaleout_ports, 1 << 3);
        assert_eq!(
            s.apply(Command::NicState(NicState { rank: 1, nic: 64, up: false }), peer(1)).unwrap_err(),
            ServerErr::PortOutOfRange(64)
        );
    }

    #[test]
    fn log_msg_is_not_a_phase() {
        let mut s = formed(1);
        let cmd = Command::LogMsg { rank: 0, level: LogLevel::Info, timestamp_us: 0, text: "x".into() };
        assert_eq!(s.apply(cmd, peer(0)).unwrap_err(), ServerErr::Unexpected(CommandId::LogMsg));
        assert_eq!(s.delivered(CommandId::LogMsg), 0);
    }
}
