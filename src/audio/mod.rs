//! Audio primitives: rings, PCM codecs and the real-time host bridge

use std::sync::Arc;

use crate::types::MAX_DEVICE_CHANNELS;

pub mod bridge;
pub mod codec;
pub mod ring;

pub use bridge::{BridgeFault, IoBridge};
pub use ring::SpscRing;

/// One SPSC ring per device channel
pub type ChannelRings = [SpscRing<f32>; MAX_DEVICE_CHANNELS];

/// Allocate the 128 channel rings, each holding `capacity` samples
#[must_use]
pub fn new_channel_rings(capacity: usize) -> Arc<ChannelRings> {
    Arc::new(std::array::from_fn(|_| SpscRing::new(capacity)))
}
