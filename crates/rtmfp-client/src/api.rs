//! Flat library API over one process-wide [`Invoker`]
//!
//! Mirrors the historical C surface: handles and media ids are plain
//! integers, 0 means failure, and reads and writes return a negative value
//! on error. Any interrupt reported by a call tears the instance down;
//! call [`init`] again to start over.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::{GroupConfig, Parameters, RtmfpConfig};
use crate::connection::StreamRole;
use crate::error::{ClientError, CloseStatus, Interrupt, Result};
use crate::events::EventMask;
use crate::handle::Handle;
use crate::invoker::Invoker;
use crate::logging::{self, DumpCallback, LogCallback};

/// 0.4.0 packed as `major << 24 | minor << 16 | patch`
pub const LIB_VERSION: i32 = 0x0004_0000;

static INSTANCE: RwLock<Option<Arc<Invoker>>> = parking_lot::const_rwlock(None);

/// Parameters applied to the next instance, kept across terminate
static PARAMETERS: RwLock<Option<Parameters>> = parking_lot::const_rwlock(None);

fn instance() -> Result<Arc<Invoker>> {
    INSTANCE.read().clone().ok_or(ClientError::NotInitialized)
}

fn handle(ctx: u32) -> Result<Handle> {
    Handle::from_raw(ctx).ok_or(ClientError::NotFound(ctx))
}

/// Log an error and tear the instance down when it is an interrupt
pub fn handle_error(error: &ClientError) -> i32 {
    if error.is_interrupt() {
        warn!("{}, terminating", error);
        terminate();
    } else if error.is_precondition() {
        error!("{}", error);
    } else {
        debug!("{}", error);
    }
    error.code()
}

fn or_zero<T: Default>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        handle_error(&e);
        T::default()
    })
}

/// Start the library and reset `config` and `group_config` to defaults
///
/// A second call keeps the running instance and only resets the configs
/// and the callbacks.
pub fn init(
    config: Option<&mut RtmfpConfig>,
    group_config: Option<&mut GroupConfig>,
    on_log: Option<LogCallback>,
    on_dump: Option<DumpCallback>,
) {
    logging::install(on_log, on_dump);
    let parameters = PARAMETERS.read().clone().unwrap_or_default();
    logging::set_level(parameters.log_level);

    {
        let mut instance = INSTANCE.write();
        if instance.is_none() {
            match Invoker::new(parameters) {
                Ok(invoker) => *instance = Some(Arc::new(invoker)),
                Err(e) => error!("Unable to start RTMFP: {}", e),
            }
        }
    }

    if let Some(config) = config {
        *config = RtmfpConfig::default();
    }
    if let Some(group_config) = group_config {
        *group_config = GroupConfig::default();
    }
}

/// Stop the library, closing every connection
pub fn terminate() {
    let invoker = INSTANCE.write().take();
    if let Some(invoker) = invoker {
        invoker.terminate();
    }
}

pub fn lib_version() -> i32 {
    LIB_VERSION
}

/// Open a connection; returns its handle or 0
pub fn connect(url: &str, config: RtmfpConfig) -> u32 {
    or_zero(instance().and_then(|invoker| invoker.connect(url, config)).map(Handle::raw))
}

/// Play `stream` from a peer; returns the media id or 0
pub fn connect2_peer(ctx: u32, peer_id: &str, stream: &str, blocking: bool) -> u16 {
    or_zero(instance().and_then(|invoker| invoker.connect2_peer(handle(ctx)?, peer_id, stream, blocking)))
}

/// Join a NetGroup; returns the media id or 0
pub fn connect2_group(
    ctx: u32,
    stream: &str,
    config: &RtmfpConfig,
    group_config: GroupConfig,
    audio_reliable: bool,
    video_reliable: bool,
    fallback_url: Option<&str>,
) -> u16 {
    or_zero(instance().and_then(|invoker| {
        invoker.connect2_group(
            handle(ctx)?,
            stream,
            config,
            group_config,
            audio_reliable,
            video_reliable,
            fallback_url,
        )
    }))
}

/// Play `stream` from the server; returns the media id or 0
pub fn play(ctx: u32, stream: &str) -> u16 {
    or_zero(instance().and_then(|invoker| {
        invoker.add_stream(handle(ctx)?, StreamRole::Play, stream, true, true, false)
    }))
}

/// Publish `stream` to the server; returns the media id or 0
pub fn publish(ctx: u32, stream: &str, audio_reliable: bool, video_reliable: bool, blocking: bool) -> u16 {
    or_zero(instance().and_then(|invoker| {
        invoker.add_stream(
            handle(ctx)?,
            StreamRole::Publish,
            stream,
            audio_reliable,
            video_reliable,
            blocking,
        )
    }))
}

/// Publish `stream` directly to peers; returns the media id or 0
pub fn publish_p2p(ctx: u32, stream: &str, audio_reliable: bool, video_reliable: bool, blocking: bool) -> u16 {
    or_zero(instance().and_then(|invoker| {
        invoker.add_stream(
            handle(ctx)?,
            StreamRole::P2pPublish,
            stream,
            audio_reliable,
            video_reliable,
            blocking,
        )
    }))
}

fn close_code(result: Result<CloseStatus>) -> u16 {
    match result {
        Ok(CloseStatus::Closed) => 1,
        Ok(CloseStatus::AlreadyClosed) => 0,
        Err(e) => {
            handle_error(&e);
            0
        }
    }
}

/// 1 when the publication was closed, 0 otherwise
pub fn close_publication(ctx: u32, stream: &str) -> u16 {
    close_code(instance().and_then(|invoker| invoker.close_publication(handle(ctx)?, stream)))
}

/// 1 when the stream was closed, 0 otherwise
pub fn close_stream(ctx: u32, media_id: u16) -> u16 {
    close_code(instance().and_then(|invoker| invoker.close_stream(handle(ctx)?, media_id)))
}

pub fn close(ctx: u32, blocking: bool) {
    if ctx == 0 {
        return;
    }
    debug!("Closing connection {}", ctx);
    if let Err(e) = instance().and_then(|invoker| invoker.remove_connection(handle(ctx)?, blocking)) {
        handle_error(&e);
    }
}

/// Bytes read, or -1 when reading should stop
pub fn read(media_id: u16, ctx: u32, buf: &mut [u8]) -> i32 {
    match instance().and_then(|invoker| invoker.read(handle(ctx)?, media_id, buf)) {
        Ok(read) => i32::try_from(read).unwrap_or(i32::MAX),
        Err(e) => {
            handle_error(&e);
            -1
        }
    }
}

/// Bytes accepted, or a negative error code
pub fn write(ctx: u32, buf: &[u8]) -> i32 {
    match instance().and_then(|invoker| invoker.write(handle(ctx)?, buf)) {
        Ok(written) => i32::try_from(written).unwrap_or(i32::MAX),
        Err(e) => handle_error(&e),
    }
}

/// 1 when the invocation was queued, 0 otherwise
pub fn call_function(ctx: u32, function: &str, args: &[&str], peer_id: Option<&str>) -> u32 {
    match instance().and_then(|invoker| invoker.call_function(handle(ctx)?, function, args, peer_id)) {
        Ok(()) => 1,
        Err(e) => {
            handle_error(&e);
            0
        }
    }
}

/// Bits of `mask` that fired, or 0 on error
pub fn wait_for_event(ctx: u32, mask: EventMask) -> i8 {
    match instance().and_then(|invoker| invoker.wait_for_event(handle(ctx)?, mask)) {
        Ok(events) => events.intersection(EventMask::PUBLIC).bits() as i8,
        Err(e) => {
            handle_error(&e);
            0
        }
    }
}

/// Unblock every waiter and terminate the library
pub fn interrupt(kind: Interrupt) {
    if let Ok(invoker) = instance() {
        invoker.interrupt(kind);
    }
    terminate();
}

/// Split a URI into `(url, publication)` at its last `/` or `\`
pub fn get_publication_and_url_from_uri(uri: &str) -> Option<(String, String)> {
    crate::url::publication_and_url(uri)
}

fn update_parameters(update: impl Fn(&mut Parameters) -> Result<()>) {
    let result = {
        let mut parameters = PARAMETERS.write();
        update(parameters.get_or_insert_with(Parameters::default))
            .map(|_| parameters.as_ref().map_or(6, |p| p.log_level))
    };
    match result {
        Ok(log_level) => {
            logging::set_level(log_level);
            if let Ok(invoker) = instance() {
                if let Err(e) = invoker.update_parameters(&update) {
                    error!("{}", e);
                }
            }
        }
        Err(e) => error!("{}", e),
    }
}

/// Set `logLevel`, `socketReceiveSize`, `socketSendSize` or
/// `timeoutFallback` (case-insensitive)
pub fn set_int_parameter(name: &str, value: i32) {
    update_parameters(|parameters| parameters.set_int(name, value));
}

pub fn set_parameter(name: &str, value: &str) {
    update_parameters(|parameters| parameters.set(name, value));
}

/// Parameters the next connection will use
pub fn parameters() -> Parameters {
    match instance() {
        Ok(invoker) => invoker.parameters(),
        Err(_) => PARAMETERS.read().clone().unwrap_or_default(),
    }
}
