//! RTMFP Client Library
//!
//! Connections, streams, peer links and NetGroups over RTMFP, driven by one
//! background worker thread and exposed through blocking-event calls.
//!
//! # Example
//!
//! ```ignore
//! use rtmfp_client::{Event, Invoker, Parameters, RtmfpConfig, StreamRole};
//!
//! fn main() -> rtmfp_client::Result<()> {
//!     let invoker = Invoker::new(Parameters::default())?;
//!     let ctx = invoker.connect("rtmfp://localhost/live", RtmfpConfig::default().blocking(true))?;
//!
//!     let media = invoker.add_stream(ctx, StreamRole::Play, "cam", true, true, false)?;
//!     let mut buf = vec![0u8; 64 * 1024];
//!     loop {
//!         let read = invoker.read(ctx, media, &mut buf)?;
//!         // hand &buf[..read] to an FLV consumer
//!     }
//! }
//! ```
//!
//! The [`api`] module offers the same operations as flat functions over a
//! process-wide instance.

pub mod api;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod events;
mod flow;
mod group;
pub mod handle;
mod handshake;
pub mod invoker;
mod link;
pub mod logging;
mod session;
pub mod url;
pub mod worker;

pub use config::{GroupConfig, Parameters, RtmfpConfig};
pub use connection::{ConnectionState, StreamRole};
pub use driver::{Command, Driver, EventSink};
pub use error::{ClientError, CloseStatus, Interrupt, Result};
pub use events::{Event, EventMask};
pub use handle::Handle;
pub use invoker::Invoker;
pub use crate::url::RtmfpUrl;
pub use worker::UdpDriver;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{GroupConfig, Parameters, RtmfpConfig};
    pub use crate::connection::StreamRole;
    pub use crate::error::{ClientError, Interrupt, Result};
    pub use crate::events::{Event, EventMask};
    pub use crate::handle::Handle;
    pub use crate::invoker::Invoker;
}
