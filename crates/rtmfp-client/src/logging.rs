//! Log and packet dump routing
//!
//! Library logs go through `tracing`. [`install`] sets up a process-wide
//! subscriber once: a reloadable level filter driven by the `logLevel`
//! parameter, and either a compact `fmt` layer or the application's log
//! callback. Both callbacks can be replaced on later calls.

use parking_lot::RwLock;
use std::fmt::{self, Write};
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as fmt_layer, reload, Registry};

/// Receives `(level, file, line, message)`; level uses the `logLevel` scale
pub type LogCallback = Arc<dyn Fn(u8, &str, u32, &str) + Send + Sync>;

/// Receives `(name, plaintext)` of every datagram sent or received
pub type DumpCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

static ON_LOG: RwLock<Option<LogCallback>> = parking_lot::const_rwlock(None);
static ON_DUMP: RwLock<Option<DumpCallback>> = parking_lot::const_rwlock(None);
static RELOAD: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

/// Map the numeric `logLevel` scale to a filter:
/// 0 off, 1-3 error, 4 warn, 5-6 info, 7 debug, 8+ trace
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1..=3 => LevelFilter::ERROR,
        4 => LevelFilter::WARN,
        5 | 6 => LevelFilter::INFO,
        7 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Numeric level reported to the log callback
pub fn level_number(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG => 7,
        Level::TRACE => 8,
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            let _ = write!(self.0, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

/// Forwards events to the installed log callback
struct CallbackLayer;

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(callback) = ON_LOG.read().clone() else {
            return;
        };
        let metadata = event.metadata();
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        callback(
            level_number(metadata.level()),
            metadata.file().unwrap_or_default(),
            metadata.line().unwrap_or_default(),
            &visitor.0,
        );
    }
}

/// Install the subscriber (first call only) and set the callbacks
///
/// Returns false when another global subscriber was already installed by
/// the application; callbacks and level changes then have no effect on it.
pub fn install(on_log: Option<LogCallback>, on_dump: Option<DumpCallback>) -> bool {
    *ON_LOG.write() = on_log;
    *ON_DUMP.write() = on_dump;
    if RELOAD.get().is_some() {
        return true;
    }

    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    let console = fmt_layer::layer()
        .with_target(false)
        .compact()
        .with_filter(filter_fn(|_| ON_LOG.read().is_none()));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(CallbackLayer)
        .try_init()
        .is_ok();
    if installed {
        let _ = RELOAD.set(handle);
    }
    installed
}

/// Apply a `logLevel` value
pub fn set_level(level: u8) {
    if let Some(handle) = RELOAD.get() {
        let _ = handle.modify(|filter| *filter = level_filter(level));
    }
}

/// Drop both callbacks
pub fn clear() {
    *ON_LOG.write() = None;
    *ON_DUMP.write() = None;
}

pub fn dump_enabled() -> bool {
    ON_DUMP.read().is_some()
}

/// Hand a plaintext datagram to the dump callback, if any
pub fn dump(name: &str, data: &[u8]) {
    if let Some(callback) = ON_DUMP.read().clone() {
        callback(name, data);
    }
}
