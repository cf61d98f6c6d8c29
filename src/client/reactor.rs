//! Single-threaded readiness reactor with a timer queue.
//!
//! Handlers are identified by a `mio::Token`. The reactor only tracks which
//! directions each token is watching; the sources themselves stay with their
//! owners and are passed in whenever the interest changes.

use fxhash::FxHashMap;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

pub trait EventHandler {
    fn read_event(&mut self, reactor: &mut Reactor, token: Token);
    fn write_event(&mut self, reactor: &mut Reactor, token: Token);
    fn timer_event(&mut self, reactor: &mut Reactor, token: Token);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    // Nothing is watched and no timer is pending.
    NoWork,
    TimedOut,
    Progressed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Watch {
    read: bool,
    write: bool,
    in_registry: bool,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    deadline: Instant,
    seq: u64,
    token: Token,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    watches: FxHashMap<Token, Watch>,
    timers: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            watches: FxHashMap::default(),
            timers: BinaryHeap::new(),
            next_seq: 0,
        })
    }

    pub fn register(&mut self, token: Token) {
        let previous = self.watches.insert(token, Watch::default());
        assert!(previous.is_none(), "{:?} registered twice", token);
    }

    #[cfg(test)]
    pub fn is_registered(&self, token: Token) -> bool {
        self.watches.contains_key(&token)
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        match self.watches.remove(&token) {
            Some(watch) if watch.in_registry => self.poll.registry().deregister(source),
            _ => Ok(()),
        }
    }

    pub fn watch_read<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.update(source, token, |w| w.read = true)
    }

    pub fn watch_write<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.update(source, token, |w| w.write = true)
    }

    // Connections keep reading until they die; only the tests stop one early.
    #[allow(dead_code)]
    pub fn unwatch_read<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.update(source, token, |w| w.read = false)
    }

    pub fn unwatch_write<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.update(source, token, |w| w.write = false)
    }

    pub fn is_watching_read(&self, token: Token) -> bool {
        self.watches.get(&token).map_or(false, |w| w.read)
    }

    pub fn is_watching_write(&self, token: Token) -> bool {
        self.watches.get(&token).map_or(false, |w| w.write)
    }

    // Always re-registers while some interest remains: with edge-triggered
    // readiness that re-arms the event for sources that are already ready.
    fn update<S, F>(&mut self, source: &mut S, token: Token, change: F) -> io::Result<()>
    where
        S: Source + ?Sized,
        F: FnOnce(&mut Watch),
    {
        let Some(watch) = self.watches.get_mut(&token) else {
            panic!("{:?} is not registered with the reactor", token);
        };
        change(watch);

        let interest = match (watch.read, watch.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let registry = self.poll.registry();
        match (watch.in_registry, interest) {
            (false, Some(interest)) => {
                registry.register(source, token, interest)?;
                watch.in_registry = true;
            }
            (true, Some(interest)) => registry.reregister(source, token, interest)?,
            (true, None) => {
                registry.deregister(source)?;
                watch.in_registry = false;
            }
            (false, None) => {}
        }
        Ok(())
    }

    pub fn start_timer(&mut self, delay: Duration, token: Token) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Reverse(Timer {
            deadline: Instant::now() + delay,
            seq,
            token,
        }));
    }

    pub fn cancel_timers(&mut self, token: Token) {
        self.timers.retain(|Reverse(timer)| timer.token != token);
    }

    #[cfg(test)]
    pub fn has_timers(&self, token: Token) -> bool {
        self.timers.iter().any(|Reverse(timer)| timer.token == token)
    }

    /// Fires every timer that was due on entry, then waits up to `timeout`
    /// for readiness and dispatches it.
    pub fn poll<H: EventHandler>(&mut self, handler: &mut H, timeout: Duration) -> io::Result<PollResult> {
        let watching = self.watches.values().any(|w| w.read || w.write);
        if !watching && self.timers.is_empty() {
            return Ok(PollResult::NoWork);
        }

        let mut progressed = false;
        let now = Instant::now();
        let first_new = self.next_seq;
        loop {
            match self.timers.peek() {
                Some(Reverse(timer)) if timer.deadline <= now && timer.seq < first_new => {}
                _ => break,
            }
            if let Some(Reverse(timer)) = self.timers.pop() {
                trace!(token = timer.token.0, "timer fired");
                handler.timer_event(self, timer.token);
                progressed = true;
            }
        }

        let wait = if progressed {
            Duration::ZERO
        } else {
            match self.timers.peek() {
                Some(Reverse(timer)) => timeout.min(timer.deadline.saturating_duration_since(Instant::now())),
                None => timeout,
            }
        };
        match self.poll.poll(&mut self.events, Some(wait)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                (event.token(), readable, writable)
            })
            .collect();

        // A handler may tear down any token, including one later in this
        // batch, so registration is checked before every delivery.
        for (token, readable, writable) in ready {
            if readable && self.is_watching_read(token) {
                handler.read_event(self, token);
                progressed = true;
            }
            if writable && self.is_watching_write(token) {
                handler.write_event(self, token);
                progressed = true;
            }
        }

        Ok(if progressed {
            PollResult::Progressed
        } else {
            PollResult::TimedOut
        })
    }
}
