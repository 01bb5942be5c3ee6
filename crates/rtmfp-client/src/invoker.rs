//! Session orchestrator
//!
//! The [`Invoker`] owns the connection arena and the network driver.
//! Application threads call into it; every operation takes short locks,
//! posts a [`Command`] to the driver and, for blocking variants, waits on
//! the connection's event signal.

use parking_lot::{Mutex, RwLock};
use rtmfp_core::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{GroupConfig, Parameters, RtmfpConfig};
use crate::connection::{Connection, ConnectionState, StreamRole};
use crate::driver::{Command, Driver, EventSink};
use crate::error::{ClientError, CloseStatus, Interrupt, Result};
use crate::events::{Event, EventMask, WaitOutcome};
use crate::handle::{Arena, Handle};
use crate::url::RtmfpUrl;
use crate::worker::UdpDriver;

/// How often waiters re-check interrupt callbacks
pub const WAIT_POLL: Duration = Duration::from_millis(100);

/// Longest a blocking close waits for the far ends
pub const CLOSE_WAIT: Duration = Duration::from_secs(6);

/// State shared with the driver through [`EventSink`]
pub(crate) struct Shared {
    connections: RwLock<Arena<Arc<Connection>>>,
    running: AtomicBool,
    interrupt: Mutex<Option<Interrupt>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            connections: RwLock::new(Arena::new()),
            running: AtomicBool::new(true),
            interrupt: Mutex::new(None),
        }
    }

    pub(crate) fn connection(&self, handle: Handle) -> Option<Arc<Connection>> {
        self.connections.read().get(handle).cloned()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn insert(&self, url: RtmfpUrl, config: RtmfpConfig) -> Result<Arc<Connection>> {
        let mut connections = self.connections.write();
        let handle = connections
            .insert_with(|handle| Arc::new(Connection::new(handle, url, config)))
            .ok_or_else(|| ClientError::ConnectionFailed("too many connections".to_string()))?;
        connections
            .get(handle)
            .cloned()
            .ok_or(ClientError::NotFound(handle.raw()))
    }

    fn interrupted_with(&self) -> Option<Interrupt> {
        *self.interrupt.lock()
    }
}

fn parse_peer_id(peer_id: &str) -> Result<PeerId> {
    let bytes = hex::decode(peer_id.trim())
        .map_err(|e| ClientError::InvalidParameter(format!("peer id {}: {}", peer_id, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ClientError::InvalidParameter(format!("peer id must be 32 bytes, got {}", bytes.len()))
    })
}

/// Session orchestrator: connection arena, driver and blocking waits
pub struct Invoker {
    shared: Arc<Shared>,
    driver: Arc<dyn Driver>,
    parameters: Arc<RwLock<Parameters>>,
}

impl Invoker {
    /// Start an orchestrator on the UDP driver
    pub fn new(parameters: Parameters) -> Result<Self> {
        let parameters = Arc::new(RwLock::new(parameters));
        let driver = Arc::new(UdpDriver::new(parameters.clone()));
        Self::start(driver, parameters)
    }

    /// Start an orchestrator on another driver
    pub fn with_driver(driver: Arc<dyn Driver>, parameters: Parameters) -> Result<Self> {
        Self::start(driver, Arc::new(RwLock::new(parameters)))
    }

    fn start(driver: Arc<dyn Driver>, parameters: Arc<RwLock<Parameters>>) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        driver.start(EventSink::new(&shared))?;
        info!("RTMFP orchestrator started");
        Ok(Self {
            shared,
            driver,
            parameters,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn parameters(&self) -> Parameters {
        self.parameters.read().clone()
    }

    /// Change parameters; socket sizes apply to connections opened afterwards
    pub fn update_parameters(&self, update: impl FnOnce(&mut Parameters) -> Result<()>) -> Result<()> {
        update(&mut self.parameters.write())
    }

    fn check(&self) -> Result<()> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(ClientError::Terminated)
        }
    }

    fn get(&self, handle: Handle) -> Result<Arc<Connection>> {
        self.check()?;
        self.shared
            .connection(handle)
            .ok_or(ClientError::NotFound(handle.raw()))
    }

    pub fn connection_state(&self, handle: Handle) -> Result<ConnectionState> {
        Ok(self.get(handle)?.state())
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    fn wait(&self, conn: &Connection, mask: EventMask, extra: Option<&RtmfpConfig>) -> Result<EventMask> {
        let outcome = conn.signal().wait(mask, WAIT_POLL, || {
            !self.shared.is_running()
                || conn.config().interrupted()
                || extra.is_some_and(RtmfpConfig::interrupted)
        });
        match outcome {
            WaitOutcome::Events(events) => {
                self.check()?;
                Ok(events)
            }
            WaitOutcome::Failed => Err(ClientError::ConnectionFailed(
                conn.failure()
                    .unwrap_or_else(|| "connection failed".to_string()),
            )),
            WaitOutcome::Closed => Err(ClientError::ConnectionFailed("connection closed".to_string())),
            WaitOutcome::Interrupted => Err(ClientError::Interrupted(
                self.shared.interrupted_with().unwrap_or(Interrupt::Last),
            )),
            WaitOutcome::Stopped if !self.shared.is_running() => Err(self
                .shared
                .interrupted_with()
                .map_or(ClientError::Terminated, ClientError::Interrupted)),
            WaitOutcome::Stopped => {
                debug!("Connection {} interrupted by the application", conn.handle());
                Err(ClientError::Interrupted(Interrupt::Application))
            }
        }
    }

    /// Drop a connection whose blocking open failed; the caller never got its handle
    fn discard(&self, handle: Handle) {
        if let Err(e) = self.driver.execute(Command::Disconnect { handle }) {
            debug!("Connection {}: {}", handle, e);
        }
        if self.shared.connections.write().remove(handle).is_some() {
            debug!("Connection {} discarded", handle);
        }
    }

    /// Drop a stream whose blocking open failed
    fn discard_stream(&self, conn: &Connection, media_id: u16) {
        let handle = conn.handle();
        if conn.remove_stream(media_id).is_some() {
            if let Err(e) = self.driver.execute(Command::CloseStream { handle, media_id }) {
                debug!("Connection {} stream {}: {}", handle, media_id, e);
            }
        }
    }

    /// Register a publishing stream unless the connection already publishes
    fn claim_publication(&self, conn: &Connection, role: StreamRole, stream: &str) -> Result<u16> {
        let media_id = conn.add_stream(role, stream).media_id();
        if !conn.set_publication(media_id, stream) {
            conn.remove_stream(media_id);
            return Err(ClientError::InvalidConfig(format!(
                "connection {} already publishes",
                conn.handle()
            )));
        }
        Ok(media_id)
    }

    /// Open a connection to an `rtmfp://` server URL
    pub fn connect(&self, url: &str, config: RtmfpConfig) -> Result<Handle> {
        self.check()?;
        let url = RtmfpUrl::parse(url)?;
        let conn = self.shared.insert(url.clone(), config)?;
        let handle = conn.handle();
        conn.set_state(ConnectionState::Handshaking);
        info!("Connection {} to {}", handle, url);

        let command = Command::Connect {
            handle,
            url,
            swf_url: conn.config().swf_url.clone(),
            page_url: conn.config().page_url.clone(),
            flash_ver: conn.config().flash_ver.clone(),
        };
        if let Err(e) = self.driver.execute(command) {
            self.shared.connections.write().remove(handle);
            return Err(e);
        }

        if conn.config().is_blocking {
            if let Err(e) = self.wait(&conn, Event::Connected.into(), None) {
                self.discard(handle);
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Play `stream` directly from the peer with hex ID `peer_id`
    pub fn connect2_peer(&self, handle: Handle, peer_id: &str, stream: &str, blocking: bool) -> Result<u16> {
        let conn = self.get(handle)?;
        let peer_id = parse_peer_id(peer_id)?;
        let media = conn.add_stream(StreamRole::PeerPlay, stream);
        let media_id = media.media_id();
        self.driver.execute(Command::ConnectPeer {
            handle,
            media_id,
            peer_id,
            stream: stream.to_string(),
        })?;
        if blocking {
            if let Err(e) = self.wait(&conn, Event::PeerConnected.into(), None) {
                self.discard_stream(&conn, media_id);
                return Err(e);
            }
        }
        Ok(media_id)
    }

    /// Join a NetGroup; a blocking publisher waits until the group answers
    #[allow(clippy::too_many_arguments)]
    pub fn connect2_group(
        &self,
        handle: Handle,
        stream: &str,
        config: &RtmfpConfig,
        group: GroupConfig,
        audio_reliable: bool,
        video_reliable: bool,
        fallback_url: Option<&str>,
    ) -> Result<u16> {
        let conn = self.get(handle)?;
        group.validate()?;
        let fallback = fallback_url
            .filter(|url| !url.is_empty())
            .map(RtmfpUrl::parse)
            .transpose()?;
        let role = if group.is_publisher {
            StreamRole::GroupPublish
        } else {
            StreamRole::GroupPlay
        };
        let media_id = if role == StreamRole::GroupPublish {
            self.claim_publication(&conn, role, stream)?
        } else {
            conn.add_stream(role, stream).media_id()
        };
        let wait = group.is_publisher && group.is_blocking;
        self.driver.execute(Command::ConnectGroup {
            handle,
            media_id,
            stream: stream.to_string(),
            group,
            audio_reliable,
            video_reliable,
            fallback,
        })?;
        if wait {
            if let Err(e) = self.wait(&conn, Event::GroupConnected.into(), Some(config)) {
                self.discard_stream(&conn, media_id);
                return Err(e);
            }
        }
        Ok(media_id)
    }

    /// Play, publish or P2P-publish a stream; blocking publications wait
    /// for the matching event
    pub fn add_stream(
        &self,
        handle: Handle,
        role: StreamRole,
        stream: &str,
        audio_reliable: bool,
        video_reliable: bool,
        blocking: bool,
    ) -> Result<u16> {
        let conn = self.get(handle)?;
        let event = match role {
            StreamRole::Play => None,
            StreamRole::Publish => Some(Event::Published),
            StreamRole::P2pPublish => Some(Event::P2pPublished),
            other => {
                return Err(ClientError::InvalidConfig(format!(
                    "{:?} streams are opened with connect2peer or connect2group",
                    other
                )))
            }
        };
        let media_id = if role.is_publisher() {
            self.claim_publication(&conn, role, stream)?
        } else {
            conn.add_stream(role, stream).media_id()
        };
        self.driver.execute(Command::AddStream {
            handle,
            media_id,
            role,
            stream: stream.to_string(),
            audio_reliable,
            video_reliable,
        })?;
        if let (true, Some(event)) = (blocking, event) {
            if let Err(e) = self.wait(&conn, event.into(), None) {
                self.discard_stream(&conn, media_id);
                return Err(e);
            }
        }
        Ok(media_id)
    }

    /// Copy buffered FLV data of a played stream; 0 when nothing is buffered
    pub fn read(&self, handle: Handle, media_id: u16, buf: &mut [u8]) -> Result<usize> {
        let conn = self.get(handle)?;
        let stream = conn.stream(media_id).ok_or(ClientError::StreamNotFound {
            handle: handle.raw(),
            media_id,
        })?;
        let read = stream.read(buf);
        if read == 0 && conn.state() == ConnectionState::Closed {
            return Err(ClientError::ConnectionFailed(
                conn.failure()
                    .unwrap_or_else(|| "connection closed".to_string()),
            ));
        }
        Ok(read)
    }

    /// Feed FLV bytes to the connection's publication
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        let conn = self.get(handle)?;
        let (media_id, _) = conn
            .publication()
            .ok_or(ClientError::NotPublishing(handle.raw()))?;
        for tag in conn.feed_writer(data)? {
            self.driver.execute(Command::Write {
                handle,
                media_id,
                tag,
            })?;
        }
        Ok(data.len())
    }

    /// Invoke `function` on the server, or on the peer with hex ID `peer_id`
    pub fn call_function(&self, handle: Handle, function: &str, args: &[&str], peer_id: Option<&str>) -> Result<()> {
        let conn = self.get(handle)?;
        if conn.is_closing() {
            return Err(ClientError::ConnectionFailed("connection is closing".to_string()));
        }
        let peer_id = peer_id.map(parse_peer_id).transpose()?;
        self.driver.execute(Command::Call {
            handle,
            function: function.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            peer_id,
        })
    }

    pub fn close_stream(&self, handle: Handle, media_id: u16) -> Result<CloseStatus> {
        let conn = self.get(handle)?;
        match conn.remove_stream(media_id) {
            Some(_) => {
                debug!("Connection {} closes stream {}", handle, media_id);
                self.driver.execute(Command::CloseStream { handle, media_id })?;
                Ok(CloseStatus::Closed)
            }
            None if conn.was_allocated(media_id) => Ok(CloseStatus::AlreadyClosed),
            None => Err(ClientError::StreamNotFound {
                handle: handle.raw(),
                media_id,
            }),
        }
    }

    pub fn close_publication(&self, handle: Handle, stream: &str) -> Result<CloseStatus> {
        let conn = self.get(handle)?;
        match conn.take_publication(stream) {
            Some(media_id) => {
                debug!("Connection {} closes publication {}", handle, stream);
                self.driver.execute(Command::ClosePublication {
                    handle,
                    media_id,
                    stream: stream.to_string(),
                })?;
                Ok(CloseStatus::Closed)
            }
            None => Ok(CloseStatus::AlreadyClosed),
        }
    }

    /// Close a connection; blocking waits until its sessions are closed
    pub fn remove_connection(&self, handle: Handle, blocking: bool) -> Result<CloseStatus> {
        self.check()?;
        let conn = {
            let connections = self.shared.connections.read();
            match connections.get(handle) {
                Some(conn) => conn.clone(),
                None if connections.is_stale(handle) => return Ok(CloseStatus::AlreadyClosed),
                None => return Err(ClientError::NotFound(handle.raw())),
            }
        };

        let live = conn.state() != ConnectionState::Closed;
        if live {
            conn.set_state(ConnectionState::Closing);
            if let Err(e) = self.driver.execute(Command::Disconnect { handle }) {
                warn!("Connection {}: {}", handle, e);
            }
            if blocking {
                let deadline = Instant::now() + CLOSE_WAIT;
                let outcome = conn.signal().wait(Event::Closed.into(), WAIT_POLL, || {
                    Instant::now() >= deadline || !self.shared.is_running()
                });
                if outcome == WaitOutcome::Stopped {
                    debug!("Connection {} did not close in time", handle);
                }
            }
        }

        if self.shared.connections.write().remove(handle).is_none() {
            // a concurrent close won the race
            return Ok(CloseStatus::AlreadyClosed);
        }
        info!("Connection {} removed", handle);
        Ok(CloseStatus::Closed)
    }

    /// Block until an event of `mask` fires on the connection
    pub fn wait_for_event(&self, handle: Handle, mask: EventMask) -> Result<EventMask> {
        let conn = self.get(handle)?;
        self.wait(&conn, mask, None)
    }

    /// Wake every waiter and tear the orchestrator down
    pub fn interrupt(&self, kind: Interrupt) {
        {
            let mut interrupt = self.shared.interrupt.lock();
            if interrupt.is_none() {
                *interrupt = Some(kind);
            }
        }
        warn!("RTMFP {} received", kind);
        self.terminate();
    }

    /// Stop the driver and release every connection
    pub fn terminate(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let connections = self.shared.connections.write().drain();
        for (_, conn) in &connections {
            conn.signal().interrupt();
        }
        self.driver.shutdown();
        info!(
            "RTMFP orchestrator stopped, {} connections released",
            connections.len()
        );
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("running", &self.shared.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullDriver {
        commands: Mutex<Vec<Command>>,
    }

    impl Driver for NullDriver {
        fn start(&self, _sink: EventSink) -> Result<()> {
            Ok(())
        }

        fn execute(&self, command: Command) -> Result<()> {
            self.commands.lock().push(command);
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn invoker() -> (Invoker, Arc<NullDriver>) {
        let driver = Arc::new(NullDriver::default());
        let invoker = Invoker::with_driver(driver.clone(), Parameters::default()).unwrap();
        (invoker, driver)
    }

    #[test]
    fn test_parse_peer_id() {
        let hex = "ab".repeat(32);
        assert_eq!(parse_peer_id(&hex).unwrap(), [0xAB; 32]);
        assert!(parse_peer_id("abcd").is_err());
        assert!(parse_peer_id("zz").is_err());
    }

    #[test]
    fn test_connect_posts_command() {
        let (invoker, driver) = invoker();
        let handle = invoker.connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()).unwrap();
        assert_eq!(invoker.connection_state(handle).unwrap(), ConnectionState::Handshaking);
        let commands = driver.commands.lock();
        assert!(matches!(&commands[0], Command::Connect { handle: h, .. } if *h == handle));
    }

    #[test]
    fn test_bad_url_allocates_nothing() {
        let (invoker, _driver) = invoker();
        assert!(matches!(
            invoker.connect("http://example.com/", RtmfpConfig::default()),
            Err(ClientError::InvalidUrl(_))
        ));
        assert_eq!(invoker.connection_count(), 0);
    }

    #[test]
    fn test_single_publication() {
        let (invoker, _driver) = invoker();
        let handle = invoker.connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()).unwrap();
        invoker
            .add_stream(handle, StreamRole::Publish, "cam", true, true, false)
            .unwrap();
        assert!(invoker
            .add_stream(handle, StreamRole::P2pPublish, "other", true, true, false)
            .is_err());
        assert_eq!(
            invoker.close_publication(handle, "cam").unwrap(),
            CloseStatus::Closed
        );
        assert_eq!(
            invoker.close_publication(handle, "cam").unwrap(),
            CloseStatus::AlreadyClosed
        );
    }

    #[test]
    fn test_concurrent_publishers_get_one_slot() {
        let (invoker, _driver) = invoker();
        let handle = invoker.connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()).unwrap();
        let barrier = std::sync::Barrier::new(4);
        let claimed = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|i| {
                    let invoker = &invoker;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        let name = format!("cam{}", i);
                        invoker
                            .add_stream(handle, StreamRole::Publish, &name, true, true, false)
                            .is_ok()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(claimed, 1);
        let conn = invoker.get(handle).unwrap();
        assert_eq!(conn.streams().len(), 1);
    }

    #[test]
    fn test_write_requires_publication() {
        let (invoker, driver) = invoker();
        let handle = invoker.connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()).unwrap();
        assert!(matches!(
            invoker.write(handle, b"FLV"),
            Err(ClientError::NotPublishing(_))
        ));

        invoker
            .add_stream(handle, StreamRole::Publish, "cam", true, true, false)
            .unwrap();
        // audio tag: type 8, 2 bytes of data, time 0, then previous tag size
        let tag = [8, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0xAF, 0x01, 0, 0, 0, 13];
        assert_eq!(invoker.write(handle, &tag).unwrap(), tag.len());
        let writes = driver
            .commands
            .lock()
            .iter()
            .filter(|command| matches!(command, Command::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_terminate_rejects_later_calls() {
        let (invoker, _driver) = invoker();
        invoker.terminate();
        assert!(matches!(
            invoker.connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()),
            Err(ClientError::Terminated)
        ));
    }
}
