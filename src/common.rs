///////////////////// PRELUDE /////////////////////

pub use core::{fmt::Debug, time::Duration};
pub use indexmap::{IndexMap, IndexSet};
pub use log::{debug, error, info, trace, warn};
pub use mio::{
    net::{TcpListener, TcpStream},
    Events, Poll, PollOpt, Ready, Token,
};
pub use parking_lot::{Mutex, MutexGuard};
pub use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Weak},
    time::Instant,
};

///////////////////// DEFS /////////////////////

pub type Payload = Vec<u8>;

/// Microseconds since the Unix epoch; 0 if the clock reads earlier.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Splits `0..n` into at most `max_parts` contiguous chunks of at most `per_part` elements
/// (the last chunk may be shorter). Never returns an empty chunk; `n == 0` yields no chunks.
pub fn partition(n: usize, per_part: usize, max_parts: usize) -> Vec<std::ops::Range<usize>> {
    if n == 0 {
        return vec![];
    }
    let per_part = per_part.max(1);
    let parts = ((n + per_part - 1) / per_part).min(max_parts.max(1));
    let chunk = (n + parts - 1) / parts;
    (0..parts)
        .map(|i| (i * chunk)..((i + 1) * chunk).min(n))
        .filter(|r| !r.is_empty())
        .collect()
}

#[test]
fn partition_covers_range() {
    assert!(partition(0, 4, 4).is_empty());
    assert_eq!(partition(3, 4, 4), vec![0..3]);
    assert_eq!(partition(8, 4, 4), vec![0..4, 4..8]);
    // capped by max_parts: chunks grow instead
    assert_eq!(partition(10, 2, 2), vec![0..5, 5..10]);
    let parts = partition(17, 3, 16);
    assert_eq!(parts.first().unwrap().start, 0);
    assert_eq!(parts.last().unwrap().end, 17);
    assert_eq!(parts.iter().map(|r| r.len()).sum::<usize>(), 17);
}
