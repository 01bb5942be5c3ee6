//! RTMFP Transport Layer
//!
//! Datagram transport used by the RTMFP session worker:
//! - UDP sockets with configurable kernel buffer sizes
//! - A receive pump feeding an mpsc channel
//! - Sender/receiver traits so sessions can run over other datagram carriers

pub mod error;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
pub use udp::{UdpConfig, UdpReceiver, UdpTransport};
