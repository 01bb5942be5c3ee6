//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("datagram of {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },

    #[error("transport closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
