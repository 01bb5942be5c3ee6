//! UDP Transport Tests (rtmfp-transport)
//!
//! Tests for the UDP transport implementation including:
//! - Binding and kernel buffer sizing
//! - Send/receive operations through the inherent API and the traits
//! - Datagram size limits
//! - Multiple concurrent sockets

use bytes::Bytes;
use rtmfp_transport::{
    TransportError, TransportEvent, TransportReceiver, TransportSender, UdpConfig, UdpTransport,
};
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// Basic Binding Tests
// ============================================================================

#[tokio::test]
async fn test_udp_bind_default() {
    let transport = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Bind should succeed");

    let addr = transport.local_addr().expect("Should get local address");

    assert!(addr.port() > 0, "Port should be > 0");
}

#[tokio::test]
async fn test_udp_bind_with_buffer_sizes() {
    let config = UdpConfig {
        recv_buffer_size: 262_144,
        send_buffer_size: 131_072,
        max_packet_size: 1192,
    };

    let transport = UdpTransport::bind_with_config("127.0.0.1:0", config)
        .await
        .expect("Bind with config should succeed");

    let (recv, send) = transport.buffer_sizes().expect("Should read buffer sizes");
    assert!(recv > 0, "Receive buffer should be set");
    assert!(send > 0, "Send buffer should be set");
    assert_eq!(transport.config().max_packet_size, 1192);
}

#[tokio::test]
async fn test_udp_bind_invalid_address() {
    let result = UdpTransport::bind("not an address").await;
    assert!(matches!(result, Err(TransportError::BindFailed(_))));
}

// ============================================================================
// Send/Receive Tests
// ============================================================================

#[tokio::test]
async fn test_udp_send_receive() {
    let server = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Server bind should succeed");

    let client = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Client bind should succeed");

    let server_addr = server.local_addr().unwrap();
    let client_addr = client.local_addr().unwrap();
    let mut receiver = server.start_receiver();

    client
        .send_to(b"hello udp", server_addr)
        .await
        .expect("Send should succeed");

    let result = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from()).await;

    match result {
        Ok(Some((TransportEvent::Data(data), from))) => {
            assert_eq!(data.as_ref(), b"hello udp", "Data should match");
            assert_eq!(
                from.port(),
                client_addr.port(),
                "Source port should match client"
            );
        }
        Ok(Some((TransportEvent::Error(e), _))) => {
            panic!("Receive error: {}", e);
        }
        Ok(None) => {
            panic!("Receiver closed unexpectedly");
        }
        Err(_) => {
            panic!("Timeout waiting for data");
        }
    }
}

#[tokio::test]
async fn test_udp_through_traits() {
    let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

    let server_addr = server.local_addr().unwrap();
    let mut receiver: Box<dyn TransportReceiver> = Box::new(server.start_receiver());
    let sender: Box<dyn TransportSender> = Box::new(client.clone());

    sender
        .send_to(Bytes::from_static(b"via trait"), server_addr)
        .await
        .expect("Send should succeed");

    let result = tokio::time::timeout(Duration::from_secs(2), receiver.recv()).await;

    match result {
        Ok(Some((TransportEvent::Data(data), from))) => {
            assert_eq!(data.as_ref(), b"via trait", "Data should match");
            assert_eq!(from, sender.local_addr().unwrap());
        }
        _ => {
            panic!("Failed to receive data");
        }
    }
}

#[tokio::test]
async fn test_udp_multiple_messages() {
    let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

    let server_addr = server.local_addr().unwrap();
    let mut receiver = server.start_receiver();

    for i in 0..10 {
        let msg = format!("message {}", i);
        client.send_to(msg.as_bytes(), server_addr).await.unwrap();
    }

    let mut received = 0;
    for _ in 0..10 {
        let result = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from()).await;
        if let Ok(Some((TransportEvent::Data(_), _))) = result {
            received += 1;
        }
    }

    // Allow some packet loss (UDP is unreliable)
    assert!(
        received >= 8,
        "Should receive at least 8/10 messages, got {}",
        received
    );
}

// ============================================================================
// Size Limit Tests
// ============================================================================

#[tokio::test]
async fn test_udp_rejects_oversized_send() {
    let config = UdpConfig {
        max_packet_size: 1192,
        ..Default::default()
    };
    let client = UdpTransport::bind_with_config("127.0.0.1:0", config)
        .await
        .unwrap();
    let target = client.local_addr().unwrap();

    let result = client.send_to(&[0u8; 1193], target).await;
    assert!(matches!(
        result,
        Err(TransportError::TooLarge { size: 1193, max: 1192 })
    ));
}

#[tokio::test]
async fn test_udp_drops_oversized_receive() {
    let config = UdpConfig {
        max_packet_size: 64,
        ..Default::default()
    };
    let server = UdpTransport::bind_with_config("127.0.0.1:0", config)
        .await
        .unwrap();
    let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut receiver = server.start_receiver();

    client.send_to(&[0xAB; 65], server_addr).await.unwrap();
    client.send_to(&[0xCD; 64], server_addr).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from()).await;
    match result {
        Ok(Some((TransportEvent::Data(data), _))) => {
            assert_eq!(data.len(), 64, "Only the fitting datagram arrives");
            assert_eq!(data[0], 0xCD);
        }
        _ => {
            panic!("Failed to receive the fitting datagram");
        }
    }
}

// ============================================================================
// Concurrent Tests
// ============================================================================

#[tokio::test]
async fn test_udp_concurrent_sockets() {
    let mut sockets = vec![];
    for _ in 0..5 {
        let socket = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Bind should succeed");
        sockets.push(socket);
    }

    let ports: Vec<u16> = sockets
        .iter()
        .map(|s| s.local_addr().unwrap().port())
        .collect();
    let unique_ports: HashSet<u16> = ports.iter().cloned().collect();

    assert_eq!(unique_ports.len(), 5, "All ports should be unique");
}

#[tokio::test]
async fn test_udp_bidirectional() {
    let socket_a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let socket_b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

    let addr_b = socket_b.local_addr().unwrap();

    let mut recv_a = socket_a.start_receiver();
    let mut recv_b = socket_b.start_receiver();

    socket_a.send_to(b"hello from A", addr_b).await.unwrap();

    let b_received = tokio::time::timeout(Duration::from_secs(2), recv_b.recv_from()).await;

    match b_received {
        Ok(Some((TransportEvent::Data(data), from))) => {
            assert_eq!(data.as_ref(), b"hello from A", "B should receive from A");
            socket_b.send_to(b"hello from B", from).await.unwrap();
        }
        _ => {
            panic!("B didn't receive from A");
        }
    }

    let a_received = tokio::time::timeout(Duration::from_secs(2), recv_a.recv_from()).await;

    match a_received {
        Ok(Some((TransportEvent::Data(data), _))) => {
            assert_eq!(data.as_ref(), b"hello from B", "A should receive from B");
        }
        _ => {
            panic!("A didn't receive from B");
        }
    }
}
