//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::Result;

/// Events produced by a datagram receiver
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Datagram received
    Data(Bytes),
    /// Receive error; the socket stays usable
    Error(String),
}

/// Sends datagrams to arbitrary endpoints
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Send one datagram
    async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()>;

    /// Local address the datagrams leave from
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Yields received datagrams with their source
#[async_trait]
pub trait TransportReceiver: Send {
    /// Next event, or `None` once the transport is gone
    async fn recv(&mut self) -> Option<(TransportEvent, SocketAddr)>;
}
