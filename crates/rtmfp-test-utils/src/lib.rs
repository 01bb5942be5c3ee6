//! Common test helpers and utilities for RTMFP tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - A simulated network driver answering commands with scripted events
//! - Status collectors for `on_status` callbacks

use parking_lot::Mutex;
use rtmfp_client::{ClientError, Command, Driver, Event, EventSink, Handle, Result};
use rtmfp_core::flv::FlvTag;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub fn wait_for<F>(mut check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        thread::sleep(interval);
    }
    check()
}

/// Wait for an atomic counter to reach a target value
pub fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || counter.load(Ordering::SeqCst) >= target,
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
}

// ============================================================================
// Simulated Driver
// ============================================================================

/// What the simulated network reports after a command
#[derive(Debug, Clone)]
pub enum Reply {
    Event(Event),
    Status { code: String, description: String },
    Media { media_id: u16, tag: FlvTag },
    Fail(String),
    Closed,
}

impl Reply {
    fn apply(&self, sink: &EventSink, handle: Handle) {
        match self {
            Reply::Event(event) => sink.post(handle, *event),
            Reply::Status { code, description } => sink.status(handle, code, description),
            Reply::Media { media_id, tag } => sink.media(handle, *media_id, tag),
            Reply::Fail(reason) => sink.fail(handle, reason),
            Reply::Closed => sink.closed(handle),
        }
    }
}

struct Rule {
    command: &'static str,
    reply: Reply,
    delay: Duration,
}

/// A [`Driver`] without sockets
///
/// Records every command and answers the ones matching a scripted rule
/// (by [`Command::name`]) after the rule's delay, from its own thread.
/// `disconnect` is answered with [`Event::Closed`] unless scripted.
#[derive(Default)]
pub struct SimulatedDriver {
    sink: Mutex<Option<EventSink>>,
    commands: Mutex<Vec<Command>>,
    rules: Mutex<Vec<Rule>>,
    stopped: AtomicBool,
}

impl SimulatedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post `event` `delay` after every `command`
    pub fn respond(&self, command: &'static str, event: Event, delay: Duration) -> &Self {
        self.reply(command, Reply::Event(event), delay)
    }

    pub fn reply(&self, command: &'static str, reply: Reply, delay: Duration) -> &Self {
        self.rules.lock().push(Rule {
            command,
            reply,
            delay,
        });
        self
    }

    /// Sink handed over by the invoker
    pub fn sink(&self) -> Option<EventSink> {
        self.sink.lock().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.commands.lock().iter().map(Command::name).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Driver for SimulatedDriver {
    fn start(&self, sink: EventSink) -> Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn execute(&self, command: Command) -> Result<()> {
        if self.is_stopped() {
            return Err(ClientError::Terminated);
        }
        let sink = self.sink().ok_or(ClientError::NotInitialized)?;
        let handle = command.handle();
        let name = command.name();
        debug!("Simulated {} on connection {}", name, handle);
        self.commands.lock().push(command);

        let mut replies: Vec<(Reply, Duration)> = self
            .rules
            .lock()
            .iter()
            .filter(|rule| rule.command == name)
            .map(|rule| (rule.reply.clone(), rule.delay))
            .collect();
        if replies.is_empty() && name == "disconnect" {
            replies.push((Reply::Closed, Duration::ZERO));
        }
        for (reply, delay) in replies {
            let sink = sink.clone();
            thread::spawn(move || {
                thread::sleep(delay);
                reply.apply(&sink, handle);
            });
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Status Collector - for verifying on_status callbacks
// ============================================================================

/// Collector for status messages with thread-safe access
#[derive(Clone, Default)]
pub struct StatusCollector {
    statuses: Arc<Mutex<Vec<(String, String)>>>,
    count: Arc<AtomicU32>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a callback for `RtmfpConfig::with_status`
    pub fn callback(&self) -> impl Fn(&str, &str) + Send + Sync + 'static {
        let statuses = self.statuses.clone();
        let count = self.count.clone();

        move |code, description| {
            statuses
                .lock()
                .push((code.to_string(), description.to_string()));
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least n statuses to be received
    pub fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait)
    }

    pub fn codes(&self) -> Vec<String> {
        self.statuses
            .lock()
            .iter()
            .map(|(code, _)| code.clone())
            .collect()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.statuses.lock().iter().any(|(c, _)| c == code)
    }
}
