//! UDP transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

/// UDP configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Kernel receive buffer size, 0 keeps the OS default
    pub recv_buffer_size: usize,
    /// Kernel send buffer size, 0 keeps the OS default
    pub send_buffer_size: usize,
    /// Largest datagram sent or received
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 0,
            send_buffer_size: 0,
            max_packet_size: 65507, // Max UDP payload
        }
    }
}

/// UDP transport (connectionless)
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
}

impl UdpTransport {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: &str, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;

        let sock = SockRef::from(&socket);
        if config.recv_buffer_size > 0 {
            if let Err(e) = sock.set_recv_buffer_size(config.recv_buffer_size) {
                warn!("Unable to set UDP receive buffer to {}: {}", config.recv_buffer_size, e);
            }
        }
        if config.send_buffer_size > 0 {
            if let Err(e) = sock.set_send_buffer_size(config.send_buffer_size) {
                warn!("Unable to set UDP send buffer to {}: {}", config.send_buffer_size, e);
            }
        }

        let local = socket.local_addr()?;
        info!(
            "UDP bound to {} (recv buffer {}, send buffer {})",
            local,
            sock.recv_buffer_size().unwrap_or(0),
            sock.send_buffer_size().unwrap_or(0)
        );

        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    /// Kernel buffer sizes actually granted, as (receive, send)
    pub fn buffer_sizes(&self) -> Result<(usize, usize)> {
        let sock = SockRef::from(self.socket.as_ref());
        Ok((sock.recv_buffer_size()?, sock.send_buffer_size()?))
    }

    /// Start receiving packets
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(256);
        let socket = self.socket.clone();
        let max_size = self.config.max_packet_size;

        let task = tokio::spawn(async move {
            // One spare byte so oversized datagrams are detectable
            let mut buf = vec![0u8; max_size + 1];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) if len > max_size => {
                        debug!("UDP dropped oversized datagram from {}", from);
                    }
                    Ok((len, from)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send((TransportEvent::Data(data), from)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        if tx
                            .send((
                                TransportEvent::Error(e.to_string()),
                                SocketAddr::from(([0, 0, 0, 0], 0)),
                            ))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        UdpReceiver { rx, task }
    }

    /// Send to a specific address
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        if data.len() > self.config.max_packet_size {
            return Err(TransportError::TooLarge {
                size: data.len(),
                max: self.config.max_packet_size,
            });
        }
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TransportSender for UdpTransport {
    async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()> {
        UdpTransport::send_to(self, &data, target).await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        UdpTransport::local_addr(self)
    }
}

/// UDP receiver; stops the receive task when dropped
pub struct UdpReceiver {
    rx: mpsc::Receiver<(TransportEvent, SocketAddr)>,
    task: JoinHandle<()>,
}

impl UdpReceiver {
    /// Receive the next event with source address
    pub async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

#[async_trait]
impl TransportReceiver for UdpReceiver {
    async fn recv(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_udp_send_recv() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let server_addr = server.local_addr().unwrap();
        let mut receiver = server.start_receiver();

        client.send_to(b"hello", server_addr).await.unwrap();

        let (event, from) = receiver.recv_from().await.unwrap();
        match event {
            TransportEvent::Data(data) => {
                assert_eq!(data.as_ref(), b"hello");
            }
            _ => panic!("Expected Data event"),
        }

        assert_eq!(from.port(), client.local_addr().unwrap().port());
    }
}
