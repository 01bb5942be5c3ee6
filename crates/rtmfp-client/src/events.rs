//! Waitable connection events

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Conditions a caller can wait for on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    Connected = 1,
    PeerConnected = 2,
    Published = 4,
    P2pPublished = 8,
    GroupConnected = 16,
    /// Connection failed; stays set
    Error = 64,
    /// Connection closed; stays set
    Closed = 128,
}

impl Event {
    pub const ALL: [Event; 7] = [
        Event::Connected,
        Event::PeerConnected,
        Event::Published,
        Event::P2pPublished,
        Event::GroupConnected,
        Event::Error,
        Event::Closed,
    ];

    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Set of [`Event`]s
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    pub const EMPTY: EventMask = EventMask(0);

    /// Events a caller may wait for
    pub const PUBLIC: EventMask = EventMask(0x1F);

    pub fn from_bits(bits: u8) -> Self {
        EventMask(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn insert(&mut self, event: Event) {
        self.0 |= event.bit();
    }

    pub fn remove(&mut self, other: EventMask) {
        self.0 &= !other.0;
    }

    pub fn intersection(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Event> {
        Event::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl From<Event> for EventMask {
    fn from(event: Event) -> Self {
        EventMask(event.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<Event> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Event) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

impl BitOr for Event {
    type Output = EventMask;

    fn bitor(self, rhs: Event) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOrAssign<Event> for EventMask {
    fn bitor_assign(&mut self, rhs: Event) {
        self.insert(rhs);
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Some of the requested events fired; they have been consumed
    Events(EventMask),
    /// The connection failed
    Failed,
    /// The connection was closed
    Closed,
    /// The library was interrupted
    Interrupted,
    /// The caller's stop check returned true
    Stopped,
}

#[derive(Debug, Default)]
struct SignalState {
    events: EventMask,
    interrupted: bool,
}

/// Per-connection event set with blocking waits
#[derive(Debug, Default)]
pub struct EventSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an event and wake every waiter
    pub fn post(&self, event: Event) {
        let mut state = self.state.lock();
        state.events.insert(event);
        self.cond.notify_all();
    }

    /// Wake every waiter with [`WaitOutcome::Interrupted`]
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    /// Current events without consuming them
    pub fn peek(&self) -> EventMask {
        self.state.lock().events
    }

    /// Block until an event of `mask` is set, the connection ends, or an
    /// interrupt arrives. `stop` runs without the lock held, every `poll`.
    pub fn wait(&self, mask: EventMask, poll: Duration, mut stop: impl FnMut() -> bool) -> WaitOutcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = Self::check(&mut state, mask) {
                return outcome;
            }
            if MutexGuard::unlocked(&mut state, &mut stop) {
                return WaitOutcome::Stopped;
            }
            if let Some(outcome) = Self::check(&mut state, mask) {
                return outcome;
            }
            self.cond.wait_for(&mut state, poll);
        }
    }

    fn check(state: &mut SignalState, mask: EventMask) -> Option<WaitOutcome> {
        if state.interrupted {
            return Some(WaitOutcome::Interrupted);
        }
        let hit = state.events.intersection(mask);
        if !hit.is_empty() {
            state.events.remove(hit.intersection(EventMask::PUBLIC));
            return Some(WaitOutcome::Events(hit));
        }
        if state.events.contains(Event::Error) {
            return Some(WaitOutcome::Failed);
        }
        if state.events.contains(Event::Closed) {
            return Some(WaitOutcome::Closed);
        }
        None
    }
}
