//! Connection, group and library configuration

use rtmfp_transport::UdpConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{ClientError, Result};

/// Returns true when the application wants blocking calls to give up
pub type InterruptCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Receives `(code, description)` of every status message
pub type StatusCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Receives socket-level error descriptions
pub type SocketErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-connection settings
#[derive(Clone)]
pub struct RtmfpConfig {
    /// Wait for the connection to be established in `connect`
    pub is_blocking: bool,
    pub swf_url: Option<String>,
    pub page_url: Option<String>,
    pub flash_ver: String,
    pub interrupt: Option<InterruptCallback>,
    pub on_status: Option<StatusCallback>,
    pub on_socket_error: Option<SocketErrorCallback>,
}

impl Default for RtmfpConfig {
    fn default() -> Self {
        Self {
            is_blocking: false,
            swf_url: None,
            page_url: None,
            flash_ver: "WIN 20,0,0,286".to_string(),
            interrupt: None,
            on_status: None,
            on_socket_error: None,
        }
    }
}

impl RtmfpConfig {
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.is_blocking = blocking;
        self
    }

    pub fn with_interrupt<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupt = Some(Arc::new(callback));
        self
    }

    pub fn with_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(callback));
        self
    }

    pub fn with_socket_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_socket_error = Some(Arc::new(callback));
        self
    }

    /// Whether the interrupt callback asks to stop
    pub fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|callback| callback())
    }
}

impl fmt::Debug for RtmfpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmfpConfig")
            .field("is_blocking", &self.is_blocking)
            .field("swf_url", &self.swf_url)
            .field("page_url", &self.page_url)
            .field("flash_ver", &self.flash_ver)
            .field("interrupt", &self.interrupt.is_some())
            .field("on_status", &self.on_status.is_some())
            .field("on_socket_error", &self.on_socket_error.is_some())
            .finish()
    }
}

/// NetGroup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Group specifier shared by every member
    pub net_group: String,
    /// Milliseconds between availability messages
    pub availability_update_period: u32,
    /// Extra milliseconds a fragment is kept for relaying
    pub relay_margin: u32,
    /// Milliseconds before a missing fragment is pulled
    pub fetch_period: u32,
    /// Milliseconds of media kept in the window
    pub window_duration: u32,
    /// Unacknowledged pushes allowed per neighbor
    pub push_limit: u8,
    pub is_publisher: bool,
    pub is_blocking: bool,
    pub availability_send_to_all: bool,
    pub disable_pull_timeout: bool,
    pub disable_rate_control: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            net_group: String::new(),
            availability_update_period: 100,
            relay_margin: 2000,
            fetch_period: 2500,
            window_duration: 8000,
            push_limit: 4,
            is_publisher: false,
            is_blocking: false,
            availability_send_to_all: false,
            disable_pull_timeout: false,
            disable_rate_control: false,
        }
    }
}

impl GroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.net_group.is_empty() {
            return Err(ClientError::InvalidConfig("net_group is empty".to_string()));
        }
        for (name, value) in [
            ("availability_update_period", self.availability_update_period),
            ("relay_margin", self.relay_margin),
            ("fetch_period", self.fetch_period),
            ("window_duration", self.window_duration),
        ] {
            if value == 0 {
                return Err(ClientError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.push_limit == 0 {
            return Err(ClientError::InvalidConfig("push_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Library-wide parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// 0 off, 1-3 error, 4 warn, 5-6 info, 7 debug, 8+ trace
    pub log_level: u8,
    /// Bytes, 0 keeps the OS default
    pub socket_receive_size: u32,
    /// Bytes, 0 keeps the OS default
    pub socket_send_size: u32,
    /// Seconds without group media before playing the fallback, 0 disables
    pub timeout_fallback: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            log_level: 6,
            socket_receive_size: 0,
            socket_send_size: 0,
            timeout_fallback: 0,
        }
    }
}

impl Parameters {
    /// Set a parameter by its historical name (case-insensitive)
    pub fn set_int(&mut self, name: &str, value: i32) -> Result<()> {
        let unsigned = u32::try_from(value)
            .map_err(|_| ClientError::InvalidParameter(format!("{} = {}", name, value)))?;
        match name.to_ascii_lowercase().as_str() {
            "loglevel" => {
                self.log_level = u8::try_from(unsigned)
                    .map_err(|_| ClientError::InvalidParameter(format!("{} = {}", name, value)))?;
            }
            "socketreceivesize" => self.socket_receive_size = unsigned,
            "socketsendsize" => self.socket_send_size = unsigned,
            "timeoutfallback" => self.timeout_fallback = unsigned,
            _ => return Err(ClientError::InvalidParameter(format!("unknown parameter {}", name))),
        }
        Ok(())
    }

    /// Set a parameter from its string form
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let parsed: i32 = value
            .trim()
            .parse()
            .map_err(|_| ClientError::InvalidParameter(format!("{} = {:?}", name, value)))?;
        self.set_int(name, parsed)
    }

    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            recv_buffer_size: self.socket_receive_size as usize,
            send_buffer_size: self.socket_send_size as usize,
            max_packet_size: rtmfp_core::MAX_PACKET_SIZE,
        }
    }
}
