//! # aes67
//!
//! A pure Rust library for AES67 audio-over-IP streaming.
//!
//! ## Features
//!
//! - RTP receive and transmit pipelines with L16/L24 PCM
//! - Lock-free, real-time safe bridge to the host audio callback
//! - 128-channel device routing with overlap protection
//! - SDP session parsing and generation (Riedel Artist compatible)
//! - Stream discovery via SAP announcements
//! - Multi-domain clock abstraction with monotonic fallback
//!
//! ## Example
//!
//! ```rust,no_run
//! use aes67::{Aes67Device, DeviceConfig};
//! use std::net::Ipv4Addr;
//!
//! # fn example() -> aes67::Result<()> {
//! let device = Aes67Device::new(DeviceConfig::default());
//! device.start()?;
//!
//! // Transmit device output channels 0-7 as an 8-channel L24 stream
//! let id = device.manager().add_tx(
//!     "Console Bus",
//!     Ipv4Addr::new(239, 1, 1, 1),
//!     5004,
//!     8,
//!     None,
//! )?;
//!
//! // ... host callback drives device.bridge() ...
//!
//! device.manager().remove(id)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
/// Audio primitives: rings, codecs, RT bridge
pub mod audio;
/// Multi-domain clock service
pub mod clock;
/// Stream configuration persistence
pub mod config;
/// Stream discovery
pub mod discovery;
/// Error types
pub mod error;
/// Multicast socket layer
pub mod net;
/// Wire protocols
pub mod protocol;
/// Channel routing
pub mod router;
/// Stream pipelines and lifecycle
pub mod stream;
/// Core types
pub mod types;

mod device;

// Re-exports
pub use audio::{IoBridge, SpscRing};
pub use clock::ClockService;
pub use device::Aes67Device;
pub use discovery::SapListener;
pub use error::{Aes67Error, Result};
pub use protocol::sdp::SdpSession;
pub use router::{ChannelMapping, ChannelRouter};
pub use stream::{RtpReceiver, RtpTransmitter, StreamManager};
pub use types::{
    AudioEncoding, DeviceConfig, Direction, NetworkAddress, StatsSnapshot, StreamId, StreamInfo,
};
