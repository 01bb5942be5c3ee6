//! Client error types

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Source of an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    /// Library-wide interrupt, e.g. process shutdown
    Last,
    /// The application's interrupt callback returned true
    Application,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Last => write!(f, "last interrupt"),
            Interrupt::Application => write!(f, "application interrupt"),
        }
    }
}

/// Outcome of an idempotent close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Closed,
    AlreadyClosed,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("library not initialized")]
    NotInitialized,

    #[error("library terminated")]
    Terminated,

    #[error("connection {0} not found")]
    NotFound(u32),

    #[error("stream {media_id} not found on connection {handle}")]
    StreamNotFound { handle: u32, media_id: u16 },

    #[error("connection {0} has no publication")]
    NotPublishing(u32),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("interrupted: {0}")]
    Interrupted(Interrupt),

    #[error("protocol error: {0}")]
    Protocol(#[from] rtmfp_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] rtmfp_transport::TransportError),
}

impl ClientError {
    /// Negative status code reported across the flat API
    pub fn code(&self) -> i32 {
        match self {
            ClientError::NotInitialized => -1,
            ClientError::Terminated => -2,
            ClientError::NotFound(_) => -3,
            ClientError::StreamNotFound { .. } => -4,
            ClientError::NotPublishing(_) => -5,
            ClientError::InvalidUrl(_) => -6,
            ClientError::InvalidConfig(_) => -7,
            ClientError::InvalidParameter(_) => -8,
            ClientError::ConnectionFailed(_) => -9,
            ClientError::Interrupted(Interrupt::Last) => -10,
            ClientError::Interrupted(Interrupt::Application) => -11,
            ClientError::Protocol(_) => -12,
            ClientError::Transport(_) => -13,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, ClientError::Interrupted(_))
    }

    /// Errors caused by calling into a library that is not running
    pub fn is_precondition(&self) -> bool {
        matches!(self, ClientError::NotInitialized | ClientError::Terminated)
    }
}
