//! Coordinator configuration
//!
//! Tunables consumed by the coordination server and client. Values can be set
//! programmatically with the builder-style setters or picked up from `HLCP_*`
//! environment variables with [`HlcpConfig::from_env`].

use crate::common::*;
use std::str::FromStr;

/// Coordination layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlcpConfig {
    /// Reactor worker threads of a coordination server
    pub server_io_threads: usize,
    /// Reactor worker threads of each rank's client
    pub client_io_threads: usize,
    /// Bound on every blocking wait of a setup operation
    pub op_timeout: Duration,
    /// Bound on establishing one outbound connection
    pub connect_timeout: Duration,
    /// Ranks served by one fan-out sender thread before another is added
    pub ranks_per_sender_thread: usize,
    /// Upper bound on fan-out sender threads
    pub max_sender_threads: usize,
    /// Delay after which the server logs the ranks still missing from a phase
    pub straggler_report_delay: Duration,
    /// Largest payload an endpoint accepts
    pub max_payload_size: usize,
    /// Local interface outbound connections are bound to ("" = any)
    pub interface: String,
    /// Largest comm a server agrees to form
    pub max_comm_size: u32,
}

impl Default for HlcpConfig {
    fn default() -> Self {
        Self {
            server_io_threads: 4,
            client_io_threads: 2,
            op_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            ranks_per_sender_thread: 32,
            max_sender_threads: 16,
            straggler_report_delay: Duration::from_secs(30),
            max_payload_size: 256 << 20,
            interface: String::new(),
            max_comm_size: 1 << 16,
        }
    }
}

impl HlcpConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any well-formed `HLCP_*` environment variable.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_override("HLCP_SERVER_IO_THREADS", &mut c.server_io_threads);
        env_override("HLCP_CLIENT_IO_THREADS", &mut c.client_io_threads);
        env_override_secs("HLCP_OP_TIMEOUT_SECS", &mut c.op_timeout);
        env_override_secs("HLCP_CONNECT_TIMEOUT_SECS", &mut c.connect_timeout);
        env_override("HLCP_RANKS_PER_SENDER_THREAD", &mut c.ranks_per_sender_thread);
        env_override("HLCP_MAX_SENDER_THREADS", &mut c.max_sender_threads);
        env_override_secs("HLCP_STRAGGLER_REPORT_SECS", &mut c.straggler_report_delay);
        env_override("HLCP_MAX_PAYLOAD_SIZE", &mut c.max_payload_size);
        env_override("HLCP_SOCKET_IFNAME", &mut c.interface);
        env_override("HLCP_MAX_COMM_SIZE", &mut c.max_comm_size);
        c
    }

    /// Set reactor thread counts for server and client
    pub fn io_threads(mut self, server: usize, client: usize) -> Self {
        self.server_io_threads = server.max(1);
        self.client_io_threads = client.max(1);
        self
    }

    /// Set the operation timeout
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the fan-out partitioning
    pub fn sender_threads(mut self, ranks_per_thread: usize, max_threads: usize) -> Self {
        self.ranks_per_sender_thread = ranks_per_thread.max(1);
        self.max_sender_threads = max_threads.max(1);
        self
    }

    /// Set the straggler report delay
    pub fn straggler_report_delay(mut self, delay: Duration) -> Self {
        self.straggler_report_delay = delay;
        self
    }

    /// Set the largest comm a server forms
    pub fn max_comm_size(mut self, max: u32) -> Self {
        self.max_comm_size = max.max(1);
        self
    }

    /// Bind outbound connections to a named interface
    pub fn interface(mut self, ifname: &str) -> Self {
        self.interface = ifname.to_owned();
        self
    }
}

fn env_override<T: FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring malformed {}={:?}", var, raw),
        }
    }
}

fn env_override_secs(var: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    env_override(var, &mut secs);
    *slot = Duration::from_secs(secs);
}

#[test]
fn env_overrides_defaults() {
    std::env::set_var("HLCP_MAX_SENDER_THREADS", "3");
    std::env::set_var("HLCP_OP_TIMEOUT_SECS", "7");
    std::env::set_var("HLCP_CLIENT_IO_THREADS", "not-a-number");
    std::env::set_var("HLCP_MAX_COMM_SIZE", "128");
    let c = HlcpConfig::from_env();
    std::env::remove_var("HLCP_MAX_COMM_SIZE");
    std::env::remove_var("HLCP_MAX_SENDER_THREADS");
    std::env::remove_var("HLCP_OP_TIMEOUT_SECS");
    std::env::remove_var("HLCP_CLIENT_IO_THREADS");
    assert_eq!(c.max_sender_threads, 3);
    assert_eq!(c.op_timeout, Duration::from_secs(7));
    assert_eq!(c.max_comm_size, 128);
    assert_eq!(c.client_io_threads, HlcpConfig::default().client_io_threads);
}
