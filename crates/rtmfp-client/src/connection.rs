//! Connection state shared between callers and the network driver

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rtmfp_core::flv::{FlvReader, FlvTag, FLV_HEADER};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RtmfpConfig;
use crate::events::{Event, EventSignal};
use crate::handle::Handle;
use crate::url::RtmfpUrl;
use crate::Result;

/// Unread FLV bytes kept per played stream; later tags are dropped
pub const MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// Lifecycle of one connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What a media stream does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Play,
    Publish,
    P2pPublish,
    PeerPlay,
    GroupPlay,
    GroupPublish,
}

impl StreamRole {
    /// Streams whose media can be read back by the caller
    pub fn is_reader(self) -> bool {
        matches!(
            self,
            StreamRole::Play | StreamRole::PeerPlay | StreamRole::GroupPlay
        )
    }

    pub fn is_publisher(self) -> bool {
        !self.is_reader()
    }
}

#[derive(Debug, Default)]
struct ReadQueue {
    buf: BytesMut,
    header_written: bool,
    dropped: u64,
}

/// One media stream of a connection
#[derive(Debug)]
pub struct MediaStream {
    media_id: u16,
    role: StreamRole,
    name: String,
    queue: Mutex<ReadQueue>,
}

impl MediaStream {
    pub fn new(media_id: u16, role: StreamRole, name: impl Into<String>) -> Self {
        Self {
            media_id,
            role,
            name: name.into(),
            queue: Mutex::new(ReadQueue::default()),
        }
    }

    pub fn media_id(&self) -> u16 {
        self.media_id
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a received tag; the first one is preceded by the FLV header
    pub fn push_tag(&self, tag: &FlvTag) {
        if !self.role.is_reader() {
            return;
        }
        let mut queue = self.queue.lock();
        if !queue.header_written {
            queue.buf.extend_from_slice(&FLV_HEADER);
            queue.header_written = true;
        }
        if queue.buf.len() + tag.encoded_len() > MAX_BUFFERED {
            if queue.dropped == 0 {
                warn!("Stream {} is not read, dropping media", self.name);
            }
            queue.dropped += 1;
            return;
        }
        queue.dropped = 0;
        tag.encode(&mut queue.buf);
    }

    /// Copy buffered FLV bytes into `out`
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut queue = self.queue.lock();
        let n = out.len().min(queue.buf.len());
        out[..n].copy_from_slice(&queue.buf[..n]);
        queue.buf.advance(n);
        n
    }

    pub fn buffered(&self) -> usize {
        self.queue.lock().buf.len()
    }
}

#[derive(Debug, Default)]
struct MediaIds {
    last: u16,
    allocated: HashSet<u16>,
}

/// Shared per-handle state
pub struct Connection {
    handle: Handle,
    url: RtmfpUrl,
    config: RtmfpConfig,
    state: Mutex<ConnectionState>,
    signal: EventSignal,
    streams: DashMap<u16, Arc<MediaStream>>,
    media_ids: Mutex<MediaIds>,
    publication: Mutex<Option<(u16, String)>>,
    writer: Mutex<FlvReader>,
    failure: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(handle: Handle, url: RtmfpUrl, config: RtmfpConfig) -> Self {
        Self {
            handle,
            url,
            config,
            state: Mutex::new(ConnectionState::Idle),
            signal: EventSignal::new(),
            streams: DashMap::new(),
            media_ids: Mutex::new(MediaIds::default()),
            publication: Mutex::new(None),
            writer: Mutex::new(FlvReader::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn url(&self) -> &RtmfpUrl {
        &self.url
    }

    pub fn config(&self) -> &RtmfpConfig {
        &self.config
    }

    pub fn signal(&self) -> &EventSignal {
        &self.signal
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Connection {} {} -> {}", self.handle, *current, state);
            *current = state;
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// Register a stream under a fresh media ID (never 0)
    pub fn add_stream(&self, role: StreamRole, name: &str) -> Arc<MediaStream> {
        let mut ids = self.media_ids.lock();
        let mut id = ids.last;
        loop {
            id = id.wrapping_add(1);
            if id != 0 && !self.streams.contains_key(&id) {
                break;
            }
        }
        ids.last = id;
        ids.allocated.insert(id);
        let stream = Arc::new(MediaStream::new(id, role, name));
        self.streams.insert(id, stream.clone());
        stream
    }

    pub fn stream(&self, media_id: u16) -> Option<Arc<MediaStream>> {
        self.streams.get(&media_id).map(|s| s.value().clone())
    }

    pub fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.streams.iter().map(|s| s.value().clone()).collect()
    }

    pub fn remove_stream(&self, media_id: u16) -> Option<Arc<MediaStream>> {
        let removed = self.streams.remove(&media_id).map(|(_, s)| s);
        let mut publication = self.publication.lock();
        if matches!(publication.as_ref(), Some((id, _)) if *id == media_id) {
            *publication = None;
        }
        removed
    }

    /// Whether `media_id` was handed out at some point
    pub fn was_allocated(&self, media_id: u16) -> bool {
        self.media_ids.lock().allocated.contains(&media_id)
    }

    /// Media ID and name of the current publication
    pub fn publication(&self) -> Option<(u16, String)> {
        self.publication.lock().clone()
    }

    /// Claim the publication slot; false when one is already active
    pub fn set_publication(&self, media_id: u16, name: &str) -> bool {
        let mut publication = self.publication.lock();
        if publication.is_some() {
            return false;
        }
        *publication = Some((media_id, name.to_string()));
        true
    }

    /// Release the publication named `name`
    pub fn take_publication(&self, name: &str) -> Option<u16> {
        let mut publication = self.publication.lock();
        match publication.as_ref() {
            Some((id, current)) if current == name => {
                let id = *id;
                *publication = None;
                self.streams.remove(&id);
                Some(id)
            }
            _ => None,
        }
    }

    /// Feed FLV bytes from the caller; returns the complete tags
    pub fn feed_writer(&self, data: &[u8]) -> Result<Vec<FlvTag>> {
        let mut writer = self.writer.lock();
        writer.push(data);
        let mut tags = Vec::new();
        while let Some(tag) = writer.next_tag()? {
            tags.push(tag);
        }
        Ok(tags)
    }

    /// Mark the connection failed and wake waiters
    pub fn fail(&self, reason: &str) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(reason.to_string());
            }
        }
        self.set_state(ConnectionState::Closed);
        self.signal.post(Event::Error);
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Apply an event reported by the driver
    pub fn on_event(&self, event: Event) {
        match event {
            Event::Connected => self.set_state(ConnectionState::Established),
            Event::Closed => self.set_state(ConnectionState::Closed),
            _ => {}
        }
        self.signal.post(event);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .field("streams", &self.streams.len())
            .finish()
    }
}
