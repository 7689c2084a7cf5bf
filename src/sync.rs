//! Blocking primitives shared by the reactor, the coordinator roles and their callers.

use crate::common::*;
use parking_lot::Condvar;
use std::collections::VecDeque;

/// State guarded by a mutex, paired with a condition variable that is signalled on every
/// `update`. Any thread may update; any number of threads may wait.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

/// A flag that can be set by any thread and awaited with a timeout.
#[derive(Debug, Default)]
pub struct Event {
    monitor: Monitor<bool>,
}

/// Thread-safe FIFO whose consumers may block until an element arrives.
#[derive(Debug)]
pub struct WaitQueue<T> {
    monitor: Monitor<VecDeque<T>>,
}

/// Runs a callback on a dedicated thread once `delay` has elapsed, unless cancelled first.
pub struct DelayedCall {
    shared: Arc<Monitor<TimerState>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct TimerState {
    stopped: bool,
    fired: bool,
}

///////////////////// IMPL /////////////////////

impl<T> Monitor<T> {
    pub fn new(t: T) -> Self {
        Self { state: Mutex::new(t), cond: Condvar::new() }
    }

    /// Lock without waking anyone. Callers that change state should use `update`
    /// or call `notify_all` after releasing the guard.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let r = f(&mut self.state.lock());
        self.cond.notify_all();
        r
    }

    /// Evaluates `f` now and after every wakeup until it yields `Some` or `timeout` elapses.
    /// At the deadline `f` is evaluated once more; `None` means it never produced a value.
    pub fn wait_for<R>(&self, timeout: Duration, mut f: impl FnMut(&mut T) -> Option<R>) -> Option<R> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        loop {
            if let Some(r) = f(&mut guard) {
                return Some(r);
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return f(&mut guard);
            }
        }
    }

    /// Blocks (without bound) until `f` yields `Some`.
    pub fn wait<R>(&self, mut f: impl FnMut(&mut T) -> Option<R>) -> R {
        let mut guard = self.state.lock();
        loop {
            if let Some(r) = f(&mut guard) {
                return r;
            }
            self.cond.wait(&mut guard);
        }
    }
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn signal(&self) {
        self.monitor.update(|set| *set = true);
    }
    pub fn reset(&self) {
        *self.monitor.lock() = false;
    }
    pub fn is_set(&self) -> bool {
        *self.monitor.lock()
    }
    /// true IFF the event was set before the timeout elapsed
    pub fn wait(&self, timeout: Duration) -> bool {
        self.monitor.wait_for(timeout, |set| if *set { Some(()) } else { None }).is_some()
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self { monitor: Monitor::new(VecDeque::new()) }
    }
}
impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&self, t: T) {
        self.monitor.update(|q| q.push_back(t));
    }
    pub fn try_pop(&self) -> Option<T> {
        self.monitor.lock().pop_front()
    }
    pub fn pop(&self) -> T {
        self.monitor.wait(|q| q.pop_front())
    }
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.monitor.wait_for(timeout, |q| q.pop_front())
    }
    pub fn len(&self) -> usize {
        self.monitor.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.monitor.lock().is_empty()
    }
}

impl DelayedCall {
    pub fn start<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Monitor::new(TimerState::default()));
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("hlcp-delayed".into())
            .spawn(move || {
                // either the stop flag or the deadline, whichever comes first
                let stopped = thread_shared.wait_for(delay, |s| if s.stopped { Some(()) } else { None });
                let run = {
                    let mut s = thread_shared.lock();
                    if stopped.is_some() || s.stopped {
                        false
                    } else {
                        s.fired = true;
                        true
                    }
                };
                thread_shared.notify_all();
                if run {
                    callback();
                }
            })
            .ok();
        if handle.is_none() {
            error!("failed to spawn delayed call thread; callback dropped");
        }
        Self { shared, handle }
    }

    pub fn fired(&self) -> bool {
        self.shared.lock().fired
    }

    /// Prevents the callback if it has not started yet. Returns true IFF it was prevented.
    /// Blocks until the timer thread has either observed the stop or already begun the callback.
    pub fn cancel(mut self) -> bool {
        let prevented = self.shared.update(|s| {
            s.stopped = true;
            !s.fired
        });
        if prevented {
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
        prevented
    }
}

impl Debug for DelayedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = self.shared.lock();
        f.debug_struct("DelayedCall").field("stopped", &s.stopped).field("fired", &s.fired).finish()
    }
}
