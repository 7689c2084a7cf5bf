use super::*;
use crate::protocol::{
    types::{NicState, RankCounters, RankInfoHeader, RemoteDeviceConnectionInfo, UniqueId, UNIQUE_ID_SIZE},
    CommandId,
};
use crate::runtime::{
    errors::{ClientErr, StartErr},
    ClientPhase, CoordContext, GroupState, HlcpClient, HlcpServer, MigrationCallback,
};

fn start_group(config: &HlcpConfig, n: u32) -> (HlcpServer, Vec<HlcpClient>) {
    init_logger();
    let server = HlcpServer::start(config, localhost()).unwrap();
    let clients = (0..n).map(|r| HlcpClient::start(config, server.local_addr(), r, n).unwrap()).collect();
    (server, clients)
}

// runs both bootstrap exchanges on every rank
fn bootstrap(config: &HlcpConfig, n: u32) -> (HlcpServer, Vec<HlcpClient>) {
    let (server, clients) = start_group(config, n);
    assert!(run_ranks(n, &|r| {
        let client = &clients[r as usize];
        let table = client.exchange_rank_data(RankInfoHeader::new(r, n, "localhost")).unwrap();
        assert_eq!(table.len(), n as usize);
        let row = (0..n).map(|j| vec![r as u8, j as u8]).collect();
        let column = client.exchange_qps_conf_raw(row).unwrap();
        assert_eq!(column[0], vec![0, r as u8]);
        assert_eq!(client.phase(), ClientPhase::ConfDone);
    }));
    (server, clients)
}

fn others(r: Rank, n: u32) -> Vec<Rank> {
    (0..n).filter(|&j| j != r).collect()
}

#[test]
fn four_ranks_one_box() {
    let config = test_config();
    let (server, clients) = start_group(&config, 4);
    assert!(run_ranks(4, &|r| {
        let client = &clients[r as usize];
        let table = client.exchange_rank_data(RankInfoHeader::new(r, 4, "box-0")).unwrap();
        for (j, h) in table.iter().enumerate() {
            assert_eq!(h.hccl_rank, j as Rank);
            assert_eq!(h.box_size, 4);
            assert_eq!(h.caddr.port(), clients[j].local_addr().port());
        }
        let row: Vec<RemoteDeviceConnectionInfo> = table
            .iter()
            .map(|peer| RemoteDeviceConnectionInfo {
                header: table[r as usize].clone(),
                nic_addrs: vec![IpAddr::from([192, 168, 0, r as u8])],
                qp_numbers: vec![vec![r * 100 + peer.hccl_rank]],
                host_nic_blob: vec![],
            })
            .collect();
        let column = client.exchange_qps_conf(&row).unwrap();
        for (j, info) in column.iter().enumerate() {
            assert_eq!(info.header.hccl_rank, j as Rank);
            assert_eq!(info.qp_numbers, vec![vec![j as u32 * 100 + r]]);
        }
        client.rendezvous(SyncKind::Rendezvous).unwrap();
    }));
    assert_eq!(server.state(), GroupState::Operational);
}

#[test]
fn counters_agree() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 2);
    assert!(run_ranks(2, &|r| {
        let mut counters = RankCounters::new(r, 2);
        counters.reached = true;
        counters.collectives = 7;
        counters.sent[1 - r as usize] = 42;
        counters.observed[1 - r as usize] = 42;
        let verdict = clients[r as usize].exchange_counters(counters).unwrap();
        assert!(verdict.all_reached);
        assert_eq!(verdict.counters[0].collectives, 7);
        assert_eq!(verdict.counters.len(), 2);
    }));
}

// rank 1 never shows up: rank 0 waits exactly `timeout` for the table
fn times_out_after(timeout: Duration) {
    let config = test_config().op_timeout(timeout);
    let (_server, clients) = start_group(&config, 2);
    let start = Instant::now();
    let res = clients[0].exchange_rank_data(RankInfoHeader::new(0, 2, "localhost"));
    let elapsed = start.elapsed();
    assert_eq!(res.unwrap_err(), ClientErr::Timeout(CommandId::CommData));
    assert!(elapsed >= timeout, "{:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(500), "{:?}", elapsed);
    // the failed exchange does not advance the phase
    assert_eq!(clients[0].phase(), ClientPhase::CommData);
}

#[test]
fn missing_rank_times_out() {
    times_out_after(Duration::from_secs(1));
}

#[test]
fn missing_rank_times_out_slowly() {
    times_out_after(Duration::from_secs(5));
}

#[test]
fn rendezvous_repeats() {
    let config = test_config();
    let (server, clients) = bootstrap(&config, 3);
    assert!(run_ranks(3, &|r| {
        let client = &clients[r as usize];
        client.rendezvous(SyncKind::Rendezvous).unwrap();
        client.rendezvous(SyncKind::MigrationDone).unwrap();
        client.rendezvous(SyncKind::Rendezvous).unwrap();
    }));
    assert_eq!(server.state(), GroupState::Operational);
}

#[test]
fn non_peers_exchange_directly() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 3);
    assert!(run_ranks(3, &|r| {
        let got = clients[r as usize].exchange_non_peers(&others(r, 3), |j| vec![r as u8, j as u8]).unwrap();
        assert_eq!(got.len(), 2);
        for j in others(r, 3) {
            assert_eq!(got[&j], vec![j as u8, r as u8]);
        }
    }));
}

#[test]
fn non_peers_two_ranks() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 2);
    assert!(run_ranks(2, &|r| {
        let peer = 1 - r;
        let got = clients[r as usize].exchange_non_peers(&[peer], |j| vec![r as u8, j as u8]).unwrap();
        assert_eq!(got, maplit::hashmap! { peer => vec![peer as u8, r as u8] });
    }));
}

#[test]
fn duplicate_non_peer_surfaces() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 2);
    let (_, intruder) = recorder(&config, true);
    let blob = Command::NonPeers { rank: 1, blob: vec![1] };
    let target = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), clients[0].local_addr().port());
    intruder.exchange(target, &blob, config.op_timeout).unwrap();
    // the second delivery is refused
    assert!(intruder.exchange(target, &blob, config.op_timeout).is_err());
    let res = clients[0].exchange_non_peers(&[1], |_| vec![0]);
    assert_eq!(res.unwrap_err(), ClientErr::DuplicateNonPeer(1));
    intruder.shutdown();
}

#[test]
fn sync_between_ranks_repeats() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 3);
    assert!(run_ranks(3, &|r| {
        let client = &clients[r as usize];
        client.sync_between_ranks(&others(r, 3)).unwrap();
        client.sync_between_ranks(&others(r, 3)).unwrap();
    }));
}

#[derive(Default)]
struct NicLog {
    seen: Monitor<Vec<NicState>>,
}

impl MigrationCallback for NicLog {
    fn nic_state_change(&self, state: &NicState) {
        self.seen.update(|seen| seen.push(*state));
    }
}

#[test]
fn nic_state_reaches_every_rank() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 2);
    let logs: Vec<Arc<NicLog>> = clients
        .iter()
        .map(|c| {
            let log = Arc::new(NicLog::default());
            c.set_migration_callback(log.clone());
            log
        })
        .collect();
    clients[1].report_nic_state(9, false).unwrap();
    for (client, log) in clients.iter().zip(logs.iter()) {
        let seen = log.seen.wait_for(Duration::from_secs(5), |s| s.first().copied());
        assert_eq!(seen, Some(NicState { rank: 1, nic: 9, up: false }));
        assert_eq!(client.failed_scaleout_ports(), 1 << 9);
    }
    clients[1].report_nic_state(9, true).unwrap();
    for (client, log) in clients.iter().zip(logs.iter()) {
        log.seen.wait_for(Duration::from_secs(5), |s| if s.len() == 2 { Some(()) } else { None }).unwrap();
        assert_eq!(client.failed_scaleout_ports(), 0);
    }
}

#[test]
fn nic_flaps_keep_their_order() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 3);
    let logs: Vec<Arc<NicLog>> = clients
        .iter()
        .map(|c| {
            let log = Arc::new(NicLog::default());
            c.set_migration_callback(log.clone());
            log
        })
        .collect();
    let flaps = 25;
    for _ in 0..flaps {
        clients[1].report_nic_state(4, false).unwrap();
        clients[1].report_nic_state(4, true).unwrap();
    }
    for (client, log) in clients.iter().zip(logs.iter()) {
        let seen = log
            .seen
            .wait_for(Duration::from_secs(10), |s| if s.len() == 2 * flaps { Some(s.clone()) } else { None })
            .unwrap();
        for (i, state) in seen.iter().enumerate() {
            assert_eq!(*state, NicState { rank: 1, nic: 4, up: i % 2 == 1 }, "change {}", i);
        }
        assert_eq!(client.failed_scaleout_ports(), 0);
    }
}

#[test]
fn inconsistent_group_is_fatal() {
    let config = test_config();
    let (server, clients) = start_group(&config, 2);
    assert!(run_ranks(2, &|r| {
        let box_size = if r == 0 { 2 } else { 3 };
        let res = clients[r as usize].exchange_rank_data(RankInfoHeader::new(r, box_size, "localhost"));
        assert_let![Err(ClientErr::Fatal(text)) = res => {
            assert!(text.contains("box size"));
        }];
    }));
    assert_eq!(server.state(), GroupState::Active);
}

#[test]
fn out_of_phase_calls_are_refused() {
    let config = test_config();
    let (_server, clients) = start_group(&config, 1);
    let client = &clients[0];
    assert_eq!(
        client.rendezvous(SyncKind::Rendezvous).unwrap_err(),
        ClientErr::WrongPhase { expected: ClientPhase::ConfDone, actual: ClientPhase::CommData }
    );
    assert_eq!(
        client.exchange_qps_conf_raw(vec![vec![]]).unwrap_err(),
        ClientErr::WrongPhase { expected: ClientPhase::QpsConf, actual: ClientPhase::CommData }
    );
    client.exchange_rank_data(RankInfoHeader::new(0, 1, "localhost")).unwrap();
    assert_eq!(
        client.exchange_qps_conf_raw(vec![]).unwrap_err(),
        ClientErr::RowSizeMismatch { expected: 1, got: 0 }
    );
}

#[test]
fn reset_allows_reinit() {
    let config = test_config();
    let (server, clients) = bootstrap(&config, 2);
    assert!(run_ranks(2, &|r| clients[r as usize].rendezvous(SyncKind::Rendezvous).unwrap()));
    assert_eq!(server.state(), GroupState::Operational);
    for c in clients.iter() {
        c.reset();
        assert_eq!(c.phase(), ClientPhase::CommData);
    }
    assert!(run_ranks(2, &|r| {
        clients[r as usize].exchange_rank_data(RankInfoHeader::new(r, 2, "localhost")).unwrap();
    }));
    assert_eq!(server.state(), GroupState::Active);
}

#[test]
fn collective_log_is_fire_and_forget() {
    let config = test_config();
    let (_server, clients) = bootstrap(&config, 1);
    clients[0].send_collective_log("allreduce done");
    clients[0].send_collective_log_err("allreduce failed");
    // the server keeps serving
    clients[0].rendezvous(SyncKind::Rendezvous).unwrap();
}

#[test]
fn context_lifecycle() {
    init_logger();
    let ctx = CoordContext::new(test_config());
    let id = ctx.create_unique_id(localhost()).unwrap();
    assert_eq!(ctx.create_unique_id(localhost()).unwrap_err(), StartErr::AlreadyStarted);
    assert!(id.addr().is_some());

    let comm = ctx.create_client(&id, 0, 1).unwrap();
    let client = ctx.client(comm).unwrap();
    let table = client.exchange_rank_data(RankInfoHeader::new(0, 1, "localhost")).unwrap();
    assert_eq!(table.len(), 1);
    let other = ctx.create_client(&id, 0, 1).unwrap();
    assert_ne!(comm, other);

    assert!(ctx.destroy_comm(comm));
    assert!(!ctx.destroy_comm(comm));
    assert!(ctx.client(comm).is_none());

    let bogus = UniqueId::from_bytes([0; UNIQUE_ID_SIZE]);
    assert_eq!(ctx.create_client(&bogus, 0, 1).unwrap_err(), ClientErr::Start(StartErr::InvalidUniqueId));
    ctx.shutdown();
}
