//! Seam between the orchestrator and the network
//!
//! The [`Invoker`](crate::Invoker) turns caller operations into [`Command`]s
//! and hands them to a [`Driver`]. The driver reports progress back through
//! the [`EventSink`] it was started with. [`UdpDriver`](crate::UdpDriver) is
//! the real implementation; tests plug in a simulated one.

use rtmfp_core::flv::FlvTag;
use rtmfp_core::PeerId;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::config::GroupConfig;
use crate::connection::{Connection, StreamRole};
use crate::events::Event;
use crate::handle::Handle;
use crate::invoker::Shared;
use crate::url::RtmfpUrl;
use crate::Result;

/// Work for the network driver
#[derive(Debug, Clone)]
pub enum Command {
    /// Open the server session of a new connection
    Connect {
        handle: Handle,
        url: RtmfpUrl,
        swf_url: Option<String>,
        page_url: Option<String>,
        flash_ver: String,
    },
    /// Open a direct session to a peer and play `stream` from it
    ConnectPeer {
        handle: Handle,
        media_id: u16,
        peer_id: PeerId,
        stream: String,
    },
    /// Join a NetGroup and play or publish `stream` through it
    ConnectGroup {
        handle: Handle,
        media_id: u16,
        stream: String,
        group: GroupConfig,
        audio_reliable: bool,
        video_reliable: bool,
        fallback: Option<RtmfpUrl>,
    },
    /// Play or publish a stream on the server session
    AddStream {
        handle: Handle,
        media_id: u16,
        role: StreamRole,
        stream: String,
        audio_reliable: bool,
        video_reliable: bool,
    },
    CloseStream {
        handle: Handle,
        media_id: u16,
    },
    ClosePublication {
        handle: Handle,
        media_id: u16,
        stream: String,
    },
    /// Send one media tag on the connection's publication
    Write {
        handle: Handle,
        media_id: u16,
        tag: FlvTag,
    },
    /// Remote invocation on the server, or on a peer when `peer_id` is set
    Call {
        handle: Handle,
        function: String,
        args: Vec<String>,
        peer_id: Option<PeerId>,
    },
    /// Close every session of the connection
    Disconnect {
        handle: Handle,
    },
}

impl Command {
    /// Connection the command targets
    pub fn handle(&self) -> Handle {
        match self {
            Command::Connect { handle, .. }
            | Command::ConnectPeer { handle, .. }
            | Command::ConnectGroup { handle, .. }
            | Command::AddStream { handle, .. }
            | Command::CloseStream { handle, .. }
            | Command::ClosePublication { handle, .. }
            | Command::Write { handle, .. }
            | Command::Call { handle, .. }
            | Command::Disconnect { handle } => *handle,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::ConnectPeer { .. } => "connect2peer",
            Command::ConnectGroup { .. } => "connect2group",
            Command::AddStream { .. } => "addStream",
            Command::CloseStream { .. } => "closeStream",
            Command::ClosePublication { .. } => "closePublication",
            Command::Write { .. } => "write",
            Command::Call { .. } => "call",
            Command::Disconnect { .. } => "disconnect",
        }
    }
}

/// Network side of the orchestrator
///
/// `execute` must not block: implementations queue the command and return.
pub trait Driver: Send + Sync {
    /// Start processing; events are reported through `sink`
    fn start(&self, sink: EventSink) -> Result<()>;

    fn execute(&self, command: Command) -> Result<()>;

    /// Stop processing and release every socket
    fn shutdown(&self);
}

/// Reports driver progress to the connections it belongs to
///
/// Holds only a weak reference, so a driver outliving its invoker reports
/// into nothing.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<Shared>,
}

impl EventSink {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn connection(&self, handle: Handle) -> Option<Arc<Connection>> {
        self.shared.upgrade()?.connection(handle)
    }

    /// Whether the invoker is still running
    pub fn is_alive(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.is_running())
    }

    /// Whether `handle` still refers to a live connection
    pub fn contains(&self, handle: Handle) -> bool {
        self.connection(handle).is_some()
    }

    pub fn post(&self, handle: Handle, event: Event) {
        match self.connection(handle) {
            Some(conn) => {
                debug!("Connection {} event {:?}", handle, event);
                conn.on_event(event);
            }
            None => debug!("Dropping {:?} for unknown connection {}", event, handle),
        }
    }

    /// Forward a status message to the connection's status callback
    pub fn status(&self, handle: Handle, code: &str, description: &str) {
        debug!("Connection {} status {} ({})", handle, code, description);
        if let Some(conn) = self.connection(handle) {
            if let Some(callback) = conn.config().on_status.as_ref() {
                callback(code, description);
            }
        }
    }

    /// Queue a media tag for the caller reading `media_id`
    pub fn media(&self, handle: Handle, media_id: u16, tag: &FlvTag) {
        if let Some(stream) = self
            .connection(handle)
            .and_then(|conn| conn.stream(media_id))
        {
            stream.push_tag(tag);
        }
    }

    /// Terminal failure of a connection
    pub fn fail(&self, handle: Handle, reason: &str) {
        if let Some(conn) = self.connection(handle) {
            warn!("Connection {} failed: {}", handle, reason);
            conn.fail(reason);
        }
    }

    pub fn closed(&self, handle: Handle) {
        self.post(handle, Event::Closed);
    }

    /// Report a socket error to the connection's callback
    pub fn socket_error(&self, handle: Handle, message: &str) {
        warn!("Connection {} socket error: {}", handle, message);
        if let Some(conn) = self.connection(handle) {
            if let Some(callback) = conn.config().on_socket_error.as_ref() {
                callback(message);
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("alive", &self.is_alive())
            .finish()
    }
}
