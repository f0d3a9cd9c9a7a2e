//! RTP receive pipeline
//!
//! One per RX session: a dedicated thread polls the multicast socket,
//! validates and decodes each packet, and de-interleaves the samples
//! into the mapped device input rings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::{codec, ChannelRings};
use crate::error::{Aes67Error, Result};
use crate::net::MulticastReceiver;
use crate::protocol::rtp;
use crate::protocol::sdp::SdpSession;
use crate::router::ChannelMapping;
use crate::types::{AudioEncoding, Statistics, StatsSnapshot, MAX_FRAMES_PER_PACKET};

/// Sleep applied when the socket has no pending datagram
const IDLE_POLL: Duration = Duration::from_micros(500);

/// Silence threshold for the soft connected state
const CONNECTED_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive buffer large enough for any packet within the MTU ceiling
const RECV_BUF_SIZE: usize = 2048;

/// Per-packet decode and routing state, separated from the socket loop
/// so packet handling is testable without a network.
pub(crate) struct PacketPipeline {
    encoding: AudioEncoding,
    payload_type: u8,
    num_channels: u16,
    sample_rate: u32,
    mapping: ChannelMapping,
    rings: Arc<ChannelRings>,
    stats: Arc<Statistics>,
    expected_seq: Option<u16>,
    /// Previous packet arrival and RTP timestamp for jitter tracking
    last_arrival: Option<(std::time::Instant, u32)>,
    /// RFC 3550 interarrival jitter estimate, nanoseconds
    jitter_ns: f64,
    /// Reused interleaved decode buffer, frames x channels
    interleaved: Vec<f32>,
}

impl PacketPipeline {
    pub(crate) fn new(
        sdp: &SdpSession,
        mapping: ChannelMapping,
        rings: Arc<ChannelRings>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            encoding: sdp.encoding,
            payload_type: sdp.payload_type,
            num_channels: sdp.num_channels,
            sample_rate: sdp.sample_rate,
            mapping,
            rings,
            stats,
            expected_seq: None,
            last_arrival: None,
            jitter_ns: 0.0,
            interleaved: vec![0.0; MAX_FRAMES_PER_PACKET * usize::from(sdp.num_channels)],
        }
    }

    /// Process one datagram: validate, account, decode, route
    pub(crate) fn process_datagram(&mut self, datagram: &[u8]) {
        let header = match rtp::validate_packet(datagram, self.payload_type, rtp::DEFAULT_MTU) {
            Ok(header) => header,
            Err(e) => {
                tracing::trace!("dropping malformed packet: {e}");
                self.stats.incr_malformed();
                return;
            }
        };

        let payload = rtp::payload(datagram);
        self.stats.record_received(payload.len() as u64);
        self.track_sequence(header.sequence);
        self.track_jitter(header.timestamp);

        let bytes_per_frame =
            usize::from(self.num_channels) * self.encoding.bytes_per_sample();
        if bytes_per_frame == 0 || payload.len() % bytes_per_frame != 0 {
            self.stats.incr_malformed();
            return;
        }
        let frames = payload.len() / bytes_per_frame;
        if frames == 0 || frames > MAX_FRAMES_PER_PACKET {
            self.stats.incr_malformed();
            return;
        }

        let samples = frames * usize::from(self.num_channels);
        let decoded = match self.encoding {
            AudioEncoding::L16 => codec::decode_l16(payload, &mut self.interleaved[..samples]),
            AudioEncoding::L24 => codec::decode_l24(payload, &mut self.interleaved[..samples]),
            _ => {
                self.stats.incr_malformed();
                return;
            }
        };
        if decoded < samples {
            self.stats.incr_malformed();
            return;
        }

        self.route(frames);
    }

    /// Sequence accounting: forward gaps count as loss, backward steps
    /// as reorder
    fn track_sequence(&mut self, seq: u16) {
        if let Some(expected) = self.expected_seq {
            let gap = seq.wrapping_sub(expected);
            if gap != 0 {
                if gap < 0x8000 {
                    self.stats.add_lost(u64::from(gap));
                } else {
                    self.stats.incr_out_of_order();
                }
            }
        }
        self.expected_seq = Some(seq.wrapping_add(1));
    }

    /// RFC 3550 interarrival jitter: smoothed difference between the
    /// arrival spacing and the media-timestamp spacing
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "jitter is a smoothed monitoring estimate"
    )]
    fn track_jitter(&mut self, rtp_timestamp: u32) {
        let arrival = std::time::Instant::now();
        if let Some((last_arrival, last_ts)) = self.last_arrival {
            let arrival_delta_ns = arrival.duration_since(last_arrival).as_nanos() as f64;
            let ts_delta = rtp_timestamp.wrapping_sub(last_ts) as f64;
            let media_delta_ns = ts_delta * 1_000_000_000.0 / f64::from(self.sample_rate);

            let difference = (arrival_delta_ns - media_delta_ns).abs();
            self.jitter_ns += (difference - self.jitter_ns) / 16.0;
            self.stats.set_jitter(self.jitter_ns as u64);
        }
        self.last_arrival = Some((arrival, rtp_timestamp));
    }

    /// De-interleave one packet into the mapped device rings
    fn route(&mut self, frames: usize) {
        let channels = usize::from(self.num_channels);
        let offset = usize::from(self.mapping.stream_channel_offset);
        let mut scratch = [0.0f32; MAX_FRAMES_PER_PACKET];
        let mut short_write = false;

        for stream_channel in 0..self.mapping.stream_channel_count {
            let Some(device_channel) = self.mapping.device_channel(stream_channel) else {
                continue;
            };
            let column = offset + usize::from(stream_channel);

            for frame in 0..frames {
                scratch[frame] = self.interleaved[frame * channels + column];
            }

            let written = self.rings[usize::from(device_channel)].write(&scratch[..frames]);
            if written < frames {
                short_write = true;
            }
        }

        if short_write {
            self.stats.incr_underruns();
        }
    }
}

/// RTP receiver for one multicast session
pub struct RtpReceiver {
    sdp: SdpSession,
    mapping: ChannelMapping,
    rings: Arc<ChannelRings>,
    stats: Arc<Statistics>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Create a receiver over the device input rings
    #[must_use]
    pub fn new(sdp: SdpSession, mapping: ChannelMapping, rings: Arc<ChannelRings>) -> Self {
        Self {
            sdp,
            mapping,
            rings,
            stats: Arc::new(Statistics::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Validate configuration, open the socket and launch the receive
    /// thread
    ///
    /// # Errors
    ///
    /// Validation errors for a bad descriptor or mapping, or the socket
    /// error when the group cannot be joined. No thread is left running
    /// on error.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.validate()?;

        let socket = MulticastReceiver::open(
            self.sdp.connection_address,
            self.sdp.port,
            None,
        )?;

        self.stats.reset();
        self.running.store(true, Ordering::Release);

        let mut pipeline = PacketPipeline::new(
            &self.sdp,
            self.mapping.clone(),
            Arc::clone(&self.rings),
            Arc::clone(&self.stats),
        );
        let running = Arc::clone(&self.running);
        let name = self.sdp.session_name.clone();

        let thread = std::thread::Builder::new()
            .name(format!("rx-{name}"))
            .spawn(move || {
                tracing::debug!("receive loop started for {name}");
                let mut buf = [0u8; RECV_BUF_SIZE];
                while running.load(Ordering::Acquire) {
                    match socket.recv(&mut buf) {
                        Ok((len, _src)) => pipeline.process_datagram(&buf[..len]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(IDLE_POLL);
                        }
                        Err(e) => {
                            tracing::warn!("receive error on {name}: {e}");
                            pipeline.stats.incr_malformed();
                            std::thread::sleep(IDLE_POLL);
                        }
                    }
                }
                tracing::debug!("receive loop stopped for {name}");
            })
            .map_err(Aes67Error::Network)?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the receive thread and close the socket; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the receive thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether a packet arrived within the last second
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stats
            .time_since_last_packet()
            .is_some_and(|elapsed| elapsed < CONNECTED_TIMEOUT)
    }

    /// Replace the channel mapping, restarting the pipeline if live
    ///
    /// # Errors
    ///
    /// Validation or restart errors; on validation failure the old
    /// mapping stays in effect.
    pub fn update_mapping(&mut self, mapping: ChannelMapping) -> Result<()> {
        mapping.validate()?;

        let was_running = self.is_running();
        self.stop();
        self.mapping = mapping;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Counters snapshot
    #[must_use]
    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero all counters
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// The session descriptor
    #[must_use]
    pub fn sdp(&self) -> &SdpSession {
        &self.sdp
    }

    /// The active mapping
    #[must_use]
    pub fn mapping(&self) -> &ChannelMapping {
        &self.mapping
    }

    fn validate(&self) -> Result<()> {
        let errors = self.sdp.validation_errors();
        if !errors.is_empty() {
            return Err(Aes67Error::SdpInvalid {
                message: errors.join("; "),
            });
        }
        if !matches!(self.sdp.encoding, AudioEncoding::L16 | AudioEncoding::L24) {
            return Err(Aes67Error::FormatNotSupported {
                format: self.sdp.encoding.to_string(),
            });
        }
        self.mapping.validate()?;

        let needed = u32::from(self.mapping.stream_channel_offset)
            + u32::from(self.mapping.stream_channel_count);
        if needed > u32::from(self.sdp.num_channels) {
            return Err(Aes67Error::MappingInvalid {
                message: format!(
                    "mapping needs stream channels up to {needed} but stream has {}",
                    self.sdp.num_channels
                ),
            });
        }
        Ok(())
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}
