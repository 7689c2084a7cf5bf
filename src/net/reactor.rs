use crate::common::*;
use crossbeam_utils::Backoff;
use mio_extras::channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::thread::JoinHandle;

// reserved for the control channel. client tokens start above it and are never reused
const CTL_TOKEN: Token = Token(0);

/// What a worker does with a client after its event callback returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventAction {
    Rearm,
    Exit,
    Nothing,
}

/// Something the reactor can watch. Registration is one-shot: after an event is
/// dispatched the client stays silent until it is armed again.
pub(crate) trait IoClient: Send + Sync {
    /// Interest set to watch on the next arm.
    fn interest(&self) -> Ready;
    /// Register (`fresh`) or re-register the underlying handle.
    fn monitor(&self, poll: &Poll, token: Token, interest: Ready, fresh: bool) -> std::io::Result<()>;
    fn unmonitor(&self, poll: &Poll) -> std::io::Result<()>;
    fn on_event(&self, reactor: &Reactor, token: Token, readiness: Ready) -> EventAction;
}

#[derive(Debug)]
enum ReactorCtl {
    Exit,
}

struct Registered {
    client: Arc<dyn IoClient>,
    armed: Option<Ready>,
    added: bool,
}

struct ReactorInner {
    poll: Poll,
    registry: Mutex<HashMap<Token, Registered>>,
    next_token: AtomicUsize,
    running: AtomicUsize,
    closed: AtomicBool,
    ctl_tx: Mutex<Sender<ReactorCtl>>,
    ctl_rx: Mutex<Receiver<ReactorCtl>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of worker threads sharing one `mio::Poll`. Cheap to clone; all clones
/// refer to the same pool.
#[derive(Clone)]
pub(crate) struct Reactor {
    inner: Arc<ReactorInner>,
}

///////////////////// IMPL /////////////////////

impl Reactor {
    /// Spawns `threads` workers and returns once every one of them is running.
    pub fn start(threads: usize) -> std::io::Result<Self> {
        let (ctl_tx, ctl_rx) = mio_extras::channel::channel();
        let poll = Poll::new()?;
        poll.register(&ctl_rx, CTL_TOKEN, Ready::readable(), PollOpt::edge())?;
        let reactor = Self {
            inner: Arc::new(ReactorInner {
                poll,
                registry: Default::default(),
                next_token: AtomicUsize::new(CTL_TOKEN.0 + 1),
                running: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                ctl_tx: Mutex::new(ctl_tx),
                ctl_rx: Mutex::new(ctl_rx),
                workers: Default::default(),
            }),
        };
        let threads = threads.max(1);
        for i in 0..threads {
            let worker = reactor.clone();
            let handle = std::thread::Builder::new()
                .name(format!("hlcp-io-{}", i))
                .spawn(move || worker.work());
            match handle {
                Ok(h) => reactor.inner.workers.lock().push(h),
                Err(e) => {
                    reactor.close();
                    return Err(e);
                }
            }
        }
        let backoff = Backoff::new();
        while reactor.inner.running.load(SeqCst) < threads {
            backoff.snooze();
        }
        debug!("reactor started with {} workers", threads);
        Ok(reactor)
    }

    pub fn running_workers(&self) -> usize {
        self.inner.running.load(SeqCst)
    }

    /// Associates a client with a fresh token. It is not watched until armed.
    pub fn add(&self, client: Arc<dyn IoClient>) -> Token {
        let token = Token(self.inner.next_token.fetch_add(1, SeqCst));
        self.inner.registry.lock().insert(token, Registered { client, armed: None, added: false });
        token
    }

    /// As `add`, for clients that need to know their own token.
    pub fn add_with<C: IoClient + 'static>(&self, make: impl FnOnce(Token) -> Arc<C>) -> Arc<C> {
        let token = Token(self.inner.next_token.fetch_add(1, SeqCst));
        let client = make(token);
        let registered = Registered { client: client.clone(), armed: None, added: false };
        self.inner.registry.lock().insert(token, registered);
        client
    }

    /// Watch the client's current interest set. No-op if already armed for exactly that set.
    pub fn arm(&self, token: Token) -> std::io::Result<()> {
        let mut registry = self.inner.registry.lock();
        let entry = match registry.get_mut(&token) {
            Some(entry) => entry,
            // removed in the meantime
            None => return Ok(()),
        };
        let interest = entry.client.interest();
        if entry.armed == Some(interest) {
            return Ok(());
        }
        entry.client.monitor(&self.inner.poll, token, interest, !entry.added)?;
        entry.added = true;
        entry.armed = Some(interest);
        Ok(())
    }

    /// Detach the client. Events already in flight for `token` are discarded.
    pub fn remove(&self, token: Token) {
        let removed = self.inner.registry.lock().remove(&token);
        if let Some(Registered { client, added: true, .. }) = removed {
            if let Err(e) = client.unmonitor(&self.inner.poll) {
                trace!("deregistering {:?}: {}", token, e);
            }
        }
    }

    /// Stops every worker and waits for them to exit. Must not be called from a worker.
    pub fn close(&self) {
        if self.inner.closed.swap(true, SeqCst) {
            return;
        }
        // one sentinel at a time: each wakes exactly one worker, which exits
        while self.inner.running.load(SeqCst) > 0 {
            let before = self.inner.running.load(SeqCst);
            if self.inner.ctl_tx.lock().send(ReactorCtl::Exit).is_err() {
                break;
            }
            let backoff = Backoff::new();
            while self.inner.running.load(SeqCst) >= before {
                backoff.snooze();
            }
        }
        for handle in self.inner.workers.lock().drain(..) {
            let _ = handle.join();
        }
        // clients may hold reactor clones
        self.inner.registry.lock().clear();
        debug!("reactor closed");
    }

    fn work(self) {
        self.inner.running.fetch_add(1, SeqCst);
        let mut events = Events::with_capacity(1);
        'work: loop {
            if let Err(e) = self.inner.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue 'work;
                }
                error!("reactor wait failed; worker exiting: {}", e);
                break 'work;
            }
            for event in events.iter() {
                let token = event.token();
                match self.dispatch(token, event.readiness()) {
                    EventAction::Exit => break 'work,
                    EventAction::Rearm => {
                        if let Err(e) = self.arm(token) {
                            warn!("re-arming {:?} failed: {}", token, e);
                        }
                    }
                    EventAction::Nothing => {}
                }
            }
        }
        self.inner.running.fetch_sub(1, SeqCst);
    }

    fn dispatch(&self, token: Token, readiness: Ready) -> EventAction {
        if token == CTL_TOKEN {
            return match self.inner.ctl_rx.lock().try_recv() {
                Ok(ReactorCtl::Exit) => EventAction::Exit,
                Err(_) => EventAction::Nothing,
            };
        }
        let client = {
            let mut registry = self.inner.registry.lock();
            match registry.get_mut(&token) {
                Some(entry) => {
                    entry.armed = None;
                    entry.client.clone()
                }
                None => {
                    trace!("event for removed {:?}", token);
                    return EventAction::Nothing;
                }
            }
        };
        client.on_event(self, token, readiness)
    }
}

impl Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.inner.running.load(SeqCst))
            .field("clients", &self.inner.registry.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Registration, SetReadiness};
    use std::sync::atomic::AtomicUsize;

    // A user-space readiness source counting how often it was dispatched.
    struct Ticker {
        registration: Registration,
        set: SetReadiness,
        hits: AtomicUsize,
        rearm: bool,
    }

    impl IoClient for Ticker {
        fn interest(&self) -> Ready {
            Ready::readable()
        }
        fn monitor(&self, poll: &Poll, token: Token, interest: Ready, fresh: bool) -> std::io::Result<()> {
            let opts = PollOpt::edge() | PollOpt::oneshot();
            if fresh {
                poll.register(&self.registration, token, interest, opts)
            } else {
                poll.reregister(&self.registration, token, interest, opts)
            }
        }
        fn unmonitor(&self, poll: &Poll) -> std::io::Result<()> {
            poll.deregister(&self.registration)
        }
        fn on_event(&self, _: &Reactor, _: Token, _: Ready) -> EventAction {
            let _ = self.set.set_readiness(Ready::empty());
            self.hits.fetch_add(1, SeqCst);
            if self.rearm {
                EventAction::Rearm
            } else {
                EventAction::Nothing
            }
        }
    }

    fn ticker(rearm: bool) -> Arc<Ticker> {
        let (registration, set) = Registration::new2();
        Arc::new(Ticker { registration, set, hits: AtomicUsize::new(0), rearm })
    }

    fn wait_hits(t: &Ticker, n: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if t.hits.load(SeqCst) >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_and_close() {
        let reactor = Reactor::start(3).unwrap();
        assert_eq!(reactor.running_workers(), 3);
        reactor.close();
        assert_eq!(reactor.running_workers(), 0);
        // idempotent
        reactor.close();
    }

    #[test]
    fn one_shot_dispatch_and_rearm() {
        let reactor = Reactor::start(2).unwrap();
        let t = ticker(true);
        let token = reactor.add(t.clone());
        reactor.arm(token).unwrap();
        // arming twice is harmless
        reactor.arm(token).unwrap();
        t.set.set_readiness(Ready::readable()).unwrap();
        assert!(wait_hits(&t, 1));
        t.set.set_readiness(Ready::readable()).unwrap();
        assert!(wait_hits(&t, 2));
        reactor.close();
    }

    #[test]
    fn unarmed_client_stays_silent() {
        let reactor = Reactor::start(2).unwrap();
        let t = ticker(false);
        let token = reactor.add(t.clone());
        reactor.arm(token).unwrap();
        t.set.set_readiness(Ready::readable()).unwrap();
        assert!(wait_hits(&t, 1));
        t.set.set_readiness(Ready::readable()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(t.hits.load(SeqCst), 1);
        reactor.remove(token);
        reactor.close();
    }
}
