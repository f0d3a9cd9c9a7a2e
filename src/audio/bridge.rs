//! Real-time safe host I/O bridge
//!
//! The adapter between the host audio callback and the device channel
//! rings. Called from the host's real-time thread: the two `on_*`
//! entry points never allocate, never lock, never make a system call
//! and never touch the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::ChannelRings;
use crate::types::{MAX_DEVICE_CHANNELS, MAX_FRAMES_PER_PACKET};

/// Hardware-status errors returned to the host callback
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeFault {
    /// The host presented a channel count other than 128
    #[error("host channel count mismatch")]
    ChannelCountMismatch,

    /// The host buffer is smaller than `frames * channels`
    #[error("host buffer too small")]
    BufferTooSmall,
}

/// RT-safe adapter between host buffers and device rings
///
/// Input side: network receivers produce, the host callback consumes.
/// Output side: the host callback produces, network transmitters
/// consume. Under- and overruns are counted at most once per callback.
pub struct IoBridge {
    inputs: Arc<ChannelRings>,
    outputs: Arc<ChannelRings>,
    input_underruns: AtomicU64,
    output_overruns: AtomicU64,
    faults: AtomicU64,
}

impl IoBridge {
    /// Create a bridge over the device ring arrays
    #[must_use]
    pub fn new(inputs: Arc<ChannelRings>, outputs: Arc<ChannelRings>) -> Self {
        Self {
            inputs,
            outputs,
            input_underruns: AtomicU64::new(0),
            output_overruns: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// Fill the host input buffer from the device input rings
    ///
    /// `out` is host-interleaved: sample for frame `f`, channel `c` at
    /// `f * 128 + c`. Channels that cannot supply `frames` samples are
    /// padded with silence and the underrun counter is bumped once for
    /// the whole callback. A `frames` beyond the engine ceiling yields
    /// a full buffer of silence and counts a fault.
    ///
    /// # Errors
    ///
    /// `ChannelCountMismatch` or `BufferTooSmall`; in both cases `out`
    /// is zeroed so the host never plays stale memory.
    pub fn on_read_input(
        &self,
        out: &mut [f32],
        frames: usize,
        channels: usize,
    ) -> Result<(), BridgeFault> {
        if channels != MAX_DEVICE_CHANNELS {
            out.fill(0.0);
            return Err(BridgeFault::ChannelCountMismatch);
        }
        if out.len() < frames * channels {
            out.fill(0.0);
            return Err(BridgeFault::BufferTooSmall);
        }
        if frames > MAX_FRAMES_PER_PACKET {
            out[..frames * channels].fill(0.0);
            self.faults.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut scratch = [0.0f32; MAX_FRAMES_PER_PACKET];
        let mut underflowed = false;

        for channel in 0..MAX_DEVICE_CHANNELS {
            let read = self.inputs[channel].read(&mut scratch[..frames]);
            if read < frames {
                scratch[read..frames].fill(0.0);
                underflowed = true;
            }
            for frame in 0..frames {
                out[frame * MAX_DEVICE_CHANNELS + channel] = scratch[frame];
            }
        }

        if underflowed {
            self.input_underruns.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drain the host output buffer into the device output rings
    ///
    /// `input` is host-interleaved like `on_read_input`. Samples that do
    /// not fit a ring are dropped and the overrun counter is bumped once
    /// for the whole callback. A `frames` beyond the engine ceiling
    /// discards the callback and counts a fault.
    ///
    /// # Errors
    ///
    /// `ChannelCountMismatch` or `BufferTooSmall`.
    pub fn on_write_output(
        &self,
        input: &[f32],
        frames: usize,
        channels: usize,
    ) -> Result<(), BridgeFault> {
        if channels != MAX_DEVICE_CHANNELS {
            return Err(BridgeFault::ChannelCountMismatch);
        }
        if input.len() < frames * channels {
            return Err(BridgeFault::BufferTooSmall);
        }
        if frames > MAX_FRAMES_PER_PACKET {
            self.faults.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut scratch = [0.0f32; MAX_FRAMES_PER_PACKET];
        let mut overflowed = false;

        for channel in 0..MAX_DEVICE_CHANNELS {
            for frame in 0..frames {
                scratch[frame] = input[frame * MAX_DEVICE_CHANNELS + channel];
            }
            let written = self.outputs[channel].write(&scratch[..frames]);
            if written < frames {
                overflowed = true;
            }
        }

        if overflowed {
            self.output_overruns.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Callbacks that saw at least one input ring underflow
    #[must_use]
    pub fn input_underruns(&self) -> u64 {
        self.input_underruns.load(Ordering::Relaxed)
    }

    /// Callbacks that saw at least one output ring overflow
    #[must_use]
    pub fn output_overruns(&self) -> u64 {
        self.output_overruns.load(Ordering::Relaxed)
    }

    /// Callbacks rejected for exceeding the frame ceiling
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::new_channel_rings;

    fn bridge() -> IoBridge {
        IoBridge::new(new_channel_rings(480), new_channel_rings(480))
    }

    #[test]
    fn test_read_input_deinterleaves() {
        let bridge = bridge();

        // Distinct ramps on channels 0 and 5
        bridge.inputs[0].write(&[0.1, 0.2, 0.3, 0.4]);
        bridge.inputs[5].write(&[0.5, 0.6, 0.7, 0.8]);

        let mut out = vec![0.0f32; 4 * MAX_DEVICE_CHANNELS];
        bridge.on_read_input(&mut out, 4, MAX_DEVICE_CHANNELS).unwrap();

        for frame in 0..4 {
            #[allow(clippy::cast_precision_loss)]
            let expected0 = 0.1 * (frame + 1) as f32;
            assert!((out[frame * MAX_DEVICE_CHANNELS] - expected0).abs() < 1e-6);
            assert!((out[frame * MAX_DEVICE_CHANNELS + 5] - (0.5 + 0.1 * frame as f32)).abs() < 1e-6);
            // Untouched channels read silence
            assert_eq!(out[frame * MAX_DEVICE_CHANNELS + 64], 0.0);
        }

        // Silence on other channels is an underrun (counted once)
        assert_eq!(bridge.input_underruns(), 1);
    }

    #[test]
    fn test_underrun_counted_once_per_callback() {
        let bridge = bridge();
        let mut out = vec![0.0f32; 8 * MAX_DEVICE_CHANNELS];

        bridge.on_read_input(&mut out, 8, MAX_DEVICE_CHANNELS).unwrap();
        assert_eq!(bridge.input_underruns(), 1);

        bridge.on_read_input(&mut out, 8, MAX_DEVICE_CHANNELS).unwrap();
        assert_eq!(bridge.input_underruns(), 2);
    }

    #[test]
    fn test_full_rings_cause_no_underrun() {
        let bridge = bridge();
        for ring in bridge.inputs.iter() {
            ring.write(&[0.25; 16]);
        }

        let mut out = vec![0.0f32; 16 * MAX_DEVICE_CHANNELS];
        bridge.on_read_input(&mut out, 16, MAX_DEVICE_CHANNELS).unwrap();
        assert_eq!(bridge.input_underruns(), 0);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_write_output_interleaves() {
        let bridge = bridge();
        let mut input = vec![0.0f32; 4 * MAX_DEVICE_CHANNELS];
        for frame in 0..4 {
            input[frame * MAX_DEVICE_CHANNELS + 3] = 0.75;
        }

        bridge.on_write_output(&input, 4, MAX_DEVICE_CHANNELS).unwrap();
        assert_eq!(bridge.output_overruns(), 0);

        let mut dst = [0.0f32; 4];
        assert_eq!(bridge.outputs[3].read(&mut dst), 4);
        assert!(dst.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        let mut other = [1.0f32; 4];
        assert_eq!(bridge.outputs[2].read(&mut other), 4);
        assert!(other.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_overrun_counted_once_and_excess_dropped() {
        let small = IoBridge::new(new_channel_rings(480), new_channel_rings(4));
        let input = vec![0.5f32; 8 * MAX_DEVICE_CHANNELS];

        small.on_write_output(&input, 8, MAX_DEVICE_CHANNELS).unwrap();
        assert_eq!(small.output_overruns(), 1);
        // Ring kept what fits
        assert_eq!(small.outputs[0].available(), 4);
    }

    #[test]
    fn test_channel_mismatch_zeros_and_errors() {
        let bridge = bridge();
        let mut out = vec![1.0f32; 4 * 2];
        let err = bridge.on_read_input(&mut out, 4, 2).unwrap_err();
        assert_eq!(err, BridgeFault::ChannelCountMismatch);
        assert!(out.iter().all(|&s| s == 0.0));

        let input = vec![1.0f32; 4 * 2];
        assert_eq!(
            bridge.on_write_output(&input, 4, 2),
            Err(BridgeFault::ChannelCountMismatch)
        );
    }

    #[test]
    fn test_frames_over_ceiling_fault() {
        let bridge = bridge();
        let frames = MAX_FRAMES_PER_PACKET + 1;
        let mut out = vec![1.0f32; frames * MAX_DEVICE_CHANNELS];

        bridge
            .on_read_input(&mut out, frames, MAX_DEVICE_CHANNELS)
            .unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(bridge.faults(), 1);

        let input = vec![1.0f32; frames * MAX_DEVICE_CHANNELS];
        bridge
            .on_write_output(&input, frames, MAX_DEVICE_CHANNELS)
            .unwrap();
        assert_eq!(bridge.faults(), 2);
        assert_eq!(bridge.outputs[0].available(), 0);
    }

    #[test]
    fn test_short_host_buffer_rejected() {
        let bridge = bridge();
        let mut out = vec![0.0f32; 10];
        assert_eq!(
            bridge.on_read_input(&mut out, 4, MAX_DEVICE_CHANNELS),
            Err(BridgeFault::BufferTooSmall)
        );
    }
}
