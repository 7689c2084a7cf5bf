use crate::common::*;
use crate::config::HlcpConfig;
use crate::protocol::{encode_header, types::SyncKind, Command, Message, PacketType, Rank};
use crate::runtime::{
    connection::Connection,
    coordinator::{Coordinator, HlcpNotify},
};
use crate::sync::Monitor;
use core::fmt::Debug;

mod e2e;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// short timeouts so failing tests fail fast
fn test_config() -> HlcpConfig {
    HlcpConfig::new()
        .io_threads(2, 2)
        .op_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(2))
        .sender_threads(2, 4)
        .straggler_report_delay(Duration::from_millis(200))
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// the exact bytes a coordinator puts on the wire for `cmd`
fn wire_bytes(cmd: &Command) -> Vec<u8> {
    let encoded = cmd.encode();
    let mut buf = encode_header(PacketType::Data);
    Message { id: encoded.id.wire(), param: encoded.param, payload_size: encoded.payload.len() as u32 }
        .encode(&mut buf);
    buf.extend_from_slice(&encoded.payload);
    buf
}

// Writes `bytes` on a plain blocking socket, then reads until the peer hangs up
// (or 3 seconds pass). Returns what was read.
fn raw_exchange(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    use std::io::{Read, Write};
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.write_all(bytes).unwrap();
    let mut got = vec![];
    // a reset after a drop is as good as a hangup here
    let _ = stream.read_to_end(&mut got);
    got
}

// Records every command; acks it IFF `ack`.
#[derive(Default)]
struct Recorder {
    got: Monitor<Vec<Command>>,
    ack: bool,
}

impl HlcpNotify for Recorder {
    fn on_command(&self, coord: &Arc<Coordinator>, conn: &Arc<Connection>, cmd: Command) {
        self.got.update(|got| got.push(cmd));
        if self.ack {
            coord.close_connection(conn);
        } else {
            coord.drop_connection(conn);
        }
    }
}

impl Recorder {
    fn wait_count(&self, n: usize) -> Vec<Command> {
        let got = self.got.wait_for(Duration::from_secs(5), |got| if got.len() >= n { Some(got.clone()) } else { None });
        got.unwrap_or_else(|| panic!("fewer than {} commands recorded", n))
    }
}

fn recorder(config: &HlcpConfig, ack: bool) -> (Arc<Recorder>, Arc<Coordinator>) {
    let rec = Arc::new(Recorder { got: Default::default(), ack });
    let coord = Coordinator::start(config, 2, localhost(), rec.clone()).unwrap();
    (rec, coord)
}

fn sync(rank: Rank) -> Command {
    Command::Sync { rank, kind: SyncKind::Rendezvous }
}

struct Panicked(Box<dyn std::any::Any + Send>);
impl Debug for Panicked {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(str_slice) = self.0.downcast_ref::<&'static str>() {
            f.pad(str_slice)
        } else if let Some(string) = self.0.downcast_ref::<String>() {
            f.pad(string)
        } else {
            f.pad("Box<Any>")
        }
    }
}

// Runs `task` once per rank of a comm of `n`, each in its own thread.
// Prints the OK/PANIC result of each rank, then returns true IFF none panicked.
fn run_ranks(n: u32, task: &(dyn Fn(Rank) + Sync)) -> bool {
    let mut results = vec![];
    crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..n).map(|rank| s.spawn(move |_| task(rank))).collect();
        for h in handles {
            results.push(h.join());
        }
    })
    .unwrap();

    let mut alright = true;
    for (rank, res) in results.into_iter().enumerate() {
        match res {
            Ok(()) => println!("rank {:?} OK!", rank),
            Err(e) => {
                alright = false;
                println!("rank {:?} PANIC! {:?}", rank, Panicked(e));
            }
        };
    }
    alright
}
