//! RTP transmit pipeline
//!
//! One per TX session: a dedicated thread paces itself on absolute
//! deadlines at the packet interval, gathers the mapped device output
//! rings, encodes and emits one RTP packet per interval. The wire never
//! gaps: missing host data is sent as silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::{codec, ChannelRings};
use crate::clock::ClockService;
use crate::error::{Aes67Error, Result};
use crate::net::MulticastTransmitter;
use crate::protocol::rtp::{self, RtpHeader};
use crate::protocol::sdp::SdpSession;
use crate::router::ChannelMapping;
use crate::types::{AudioEncoding, Statistics, StatsSnapshot, MAX_FRAMES_PER_PACKET};

/// Packet assembly state, separated from the socket loop so framing is
/// testable without a network.
pub(crate) struct PacketBuilder {
    encoding: AudioEncoding,
    payload_type: u8,
    mapping: ChannelMapping,
    rings: Arc<ChannelRings>,
    stats: Arc<Statistics>,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_packet: u32,
    /// Reused interleaved sample buffer, frames x channels
    interleaved: Vec<f32>,
    /// Reused encoded payload buffer
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub(crate) fn new(
        sdp: &SdpSession,
        mapping: ChannelMapping,
        rings: Arc<ChannelRings>,
        stats: Arc<Statistics>,
        ssrc: u32,
        initial_timestamp: u32,
    ) -> Self {
        let samples_per_packet = samples_per_packet(sdp);
        let frames = samples_per_packet as usize;
        let channels = usize::from(mapping.stream_channel_count);

        Self {
            encoding: sdp.encoding,
            payload_type: sdp.payload_type,
            mapping,
            rings,
            stats,
            ssrc,
            sequence: 0,
            timestamp: initial_timestamp,
            samples_per_packet,
            interleaved: vec![0.0; frames * channels],
            payload: vec![0u8; frames * channels * sdp.encoding.bytes_per_sample()],
        }
    }

    pub(crate) fn sequence(&self) -> u16 {
        self.sequence
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub(crate) fn samples_per_packet(&self) -> u32 {
        self.samples_per_packet
    }

    /// Gather, encode and frame the next packet into `out`
    ///
    /// Short ring reads are zero-filled and count one overrun for the
    /// packet. Sequence and timestamp advance modularly afterwards.
    pub(crate) fn build_packet(&mut self, out: &mut Vec<u8>) {
        let frames = self.samples_per_packet as usize;
        let channels = usize::from(self.mapping.stream_channel_count);
        let mut scratch = [0.0f32; MAX_FRAMES_PER_PACKET];
        let mut short_read = false;

        for stream_channel in 0..self.mapping.stream_channel_count {
            let read = match self.mapping.device_channel(stream_channel) {
                Some(device_channel) => {
                    self.rings[usize::from(device_channel)].read(&mut scratch[..frames])
                }
                None => 0,
            };
            if read < frames {
                scratch[read..frames].fill(0.0);
                short_read = true;
            }

            for frame in 0..frames {
                self.interleaved[frame * channels + usize::from(stream_channel)] =
                    scratch[frame];
            }
        }

        if short_read {
            self.stats.incr_overruns();
        }

        let written = match self.encoding {
            AudioEncoding::L16 => codec::encode_l16(&self.interleaved, &mut self.payload),
            _ => codec::encode_l24(&self.interleaved, &mut self.payload),
        };

        let header =
            RtpHeader::new_audio(self.payload_type, self.sequence, self.timestamp, self.ssrc);
        rtp::encode_packet(&header, &self.payload[..written], out);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet);
    }
}

fn samples_per_packet(sdp: &SdpSession) -> u32 {
    if sdp.framecount > 0 {
        sdp.framecount
    } else {
        sdp.sample_rate / 1000 * sdp.ptime.max(1)
    }
}

/// RTP transmitter for one multicast session
pub struct RtpTransmitter {
    sdp: SdpSession,
    mapping: ChannelMapping,
    rings: Arc<ChannelRings>,
    clock: Arc<ClockService>,
    stats: Arc<Statistics>,
    ssrc: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RtpTransmitter {
    /// Create a transmitter over the device output rings
    ///
    /// The SSRC is chosen randomly here and kept for the lifetime of
    /// the transmitter.
    #[must_use]
    pub fn new(
        sdp: SdpSession,
        mapping: ChannelMapping,
        rings: Arc<ChannelRings>,
        clock: Arc<ClockService>,
    ) -> Self {
        Self {
            sdp,
            mapping,
            rings,
            clock,
            stats: Arc::new(Statistics::new()),
            ssrc: rand::random::<u32>(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Validate configuration, open the socket and launch the send
    /// thread
    ///
    /// # Errors
    ///
    /// Validation errors for a bad descriptor or mapping, or the socket
    /// error when the sender cannot be opened.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.validate()?;

        let socket = MulticastTransmitter::open(
            self.sdp.connection_address,
            self.sdp.port,
            self.sdp.ttl,
            None,
        )?;

        self.stats.reset();
        self.running.store(true, Ordering::Release);

        // Media timestamp epoch derived from the stream's clock domain
        #[allow(
            clippy::cast_possible_truncation,
            reason = "RTP timestamps are modular 32-bit by definition"
        )]
        let initial_timestamp = (u128::from(self.clock.now_for_stream(&self.sdp))
            * u128::from(self.sdp.sample_rate)
            / 1_000_000_000) as u32;

        let mut builder = PacketBuilder::new(
            &self.sdp,
            self.mapping.clone(),
            Arc::clone(&self.rings),
            Arc::clone(&self.stats),
            self.ssrc,
            initial_timestamp,
        );
        let interval = Duration::from_millis(u64::from(self.sdp.ptime.max(1)));
        let running = Arc::clone(&self.running);
        let name = self.sdp.session_name.clone();

        let thread = std::thread::Builder::new()
            .name(format!("tx-{name}"))
            .spawn(move || {
                tracing::debug!("transmit loop started for {name}");
                let mut packet = Vec::new();
                let mut next_deadline = Instant::now();

                while running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if next_deadline > now {
                        std::thread::sleep(next_deadline - now);
                    }
                    next_deadline += interval;

                    builder.build_packet(&mut packet);
                    match socket.send(&packet) {
                        Ok(sent) => {
                            builder
                                .stats
                                .record_sent(sent.saturating_sub(RtpHeader::SIZE) as u64);
                        }
                        Err(e) => {
                            tracing::warn!("send error on {name}: {e}");
                            builder.stats.incr_malformed();
                        }
                    }
                }
                tracing::debug!("transmit loop stopped for {name}");
            })
            .map_err(Aes67Error::Network)?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the send thread; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the send thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
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

    /// The synchronization source id chosen at construction
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
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

        if samples_per_packet(&self.sdp) as usize > MAX_FRAMES_PER_PACKET {
            return Err(Aes67Error::StreamInvalid {
                message: format!(
                    "{} samples per packet exceeds the {MAX_FRAMES_PER_PACKET} frame ceiling",
                    samples_per_packet(&self.sdp)
                ),
            });
        }
        if self.mapping.stream_channel_count != self.sdp.num_channels {
            return Err(Aes67Error::MappingInvalid {
                message: format!(
                    "transmit mapping covers {} channels but the session declares {}",
                    self.mapping.stream_channel_count, self.sdp.num_channels
                ),
            });
        }
        Ok(())
    }
}

impl Drop for RtpTransmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::audio::new_channel_rings;
    use crate::protocol::rtp::PT_L24;
    use crate::types::StreamId;

    fn test_sdp(channels: u16) -> SdpSession {
        SdpSession {
            session_name: "tx test".to_string(),
            connection_address: Ipv4Addr::new(239, 2, 2, 2),
            port: 5004,
            payload_type: PT_L24,
            encoding: AudioEncoding::L24,
            sample_rate: 48_000,
            num_channels: channels,
            ptime: 1,
            framecount: 48,
            direction: crate::types::Direction::SendOnly,
            ..Default::default()
        }
    }

    fn builder(channels: u16) -> (PacketBuilder, Arc<ChannelRings>) {
        let sdp = test_sdp(channels);
        let mapping =
            ChannelMapping::sequential(StreamId::generate(), "tx test", 0, channels);
        let rings = new_channel_rings(480);
        let stats = Arc::new(Statistics::new());
        let builder = PacketBuilder::new(
            &sdp,
            mapping,
            Arc::clone(&rings),
            stats,
            0xCAFE_F00D,
            1000,
        );
        (builder, rings)
    }

    #[test]
    fn test_packet_layout_and_advance() {
        let (mut builder, rings) = builder(2);
        rings[0].write(&[0.5; 48]);
        rings[1].write(&[-0.5; 48]);

        let mut packet = Vec::new();
        builder.build_packet(&mut packet);

        assert_eq!(packet.len(), RtpHeader::SIZE + 48 * 2 * 3);

        let header = RtpHeader::decode(&packet).unwrap();
        assert_eq!(header.payload_type, PT_L24);
        assert_eq!(header.sequence, 0);
        assert_eq!(header.timestamp, 1000);
        assert_eq!(header.ssrc, 0xCAFE_F00D);

        // Payload is interleaved L24
        let mut decoded = vec![0.0f32; 96];
        codec::decode_l24(rtp::payload(&packet), &mut decoded);
        assert!((decoded[0] - 0.5).abs() < 1e-5);
        assert!((decoded[1] + 0.5).abs() < 1e-5);

        assert_eq!(builder.sequence(), 1);
        assert_eq!(builder.timestamp(), 1048);
        assert_eq!(builder.stats.snapshot().overruns, 0);
    }

    #[test]
    fn test_empty_rings_send_silence_and_count_overrun() {
        let (mut builder, _rings) = builder(2);
        let mut packet = Vec::new();
        builder.build_packet(&mut packet);

        let mut decoded = vec![1.0f32; 96];
        codec::decode_l24(rtp::payload(&packet), &mut decoded);
        assert!(decoded.iter().all(|&s| s == 0.0));
        assert_eq!(builder.stats.snapshot().overruns, 1);

        // One overrun per packet, not per channel
        builder.build_packet(&mut packet);
        assert_eq!(builder.stats.snapshot().overruns, 2);
    }

    #[test]
    fn test_partial_ring_zero_fills_tail() {
        let (mut builder, rings) = builder(1);
        rings[0].write(&[0.25; 10]);

        let mut packet = Vec::new();
        builder.build_packet(&mut packet);

        let mut decoded = vec![0.0f32; 48];
        codec::decode_l24(rtp::payload(&packet), &mut decoded);
        assert!(decoded[..10].iter().all(|&s| (s - 0.25).abs() < 1e-5));
        assert!(decoded[10..].iter().all(|&s| s == 0.0));
        assert_eq!(builder.stats.snapshot().overruns, 1);
    }

    #[test]
    fn test_sequence_and_timestamp_wrap() {
        let (mut builder, _rings) = builder(1);
        builder.sequence = u16::MAX;
        builder.timestamp = u32::MAX - 20;

        let mut packet = Vec::new();
        builder.build_packet(&mut packet);
        assert_eq!(builder.sequence(), 0);
        // 48 samples past u32::MAX - 20 wraps
        assert_eq!(builder.timestamp(), 27);
    }

    #[test]
    fn test_l16_payload_size() {
        let mut sdp = test_sdp(4);
        sdp.encoding = AudioEncoding::L16;
        sdp.payload_type = 96;
        let mapping = ChannelMapping::sequential(StreamId::generate(), "tx", 0, 4);
        let rings = new_channel_rings(480);
        let stats = Arc::new(Statistics::new());
        let mut builder = PacketBuilder::new(&sdp, mapping, rings, stats, 1, 0);

        let mut packet = Vec::new();
        builder.build_packet(&mut packet);
        assert_eq!(packet.len(), RtpHeader::SIZE + 48 * 4 * 2);
    }

    #[test]
    fn test_transmitter_validation() {
        let rings = new_channel_rings(480);
        let clock = Arc::new(ClockService::new());

        // Channel count mismatch between mapping and session
        let sdp = test_sdp(8);
        let mapping = ChannelMapping::sequential(StreamId::generate(), "tx", 0, 4);
        let mut tx = RtpTransmitter::new(sdp, mapping, Arc::clone(&rings), Arc::clone(&clock));
        assert!(matches!(tx.start(), Err(Aes67Error::MappingInvalid { .. })));

        // Frame count beyond the engine ceiling
        let mut sdp = test_sdp(2);
        sdp.framecount = 1024;
        let mapping = ChannelMapping::sequential(StreamId::generate(), "tx", 0, 2);
        let mut tx = RtpTransmitter::new(sdp, mapping, rings, clock);
        assert!(matches!(tx.start(), Err(Aes67Error::StreamInvalid { .. })));
    }

    #[test]
    fn test_samples_per_packet_derivation() {
        let mut sdp = test_sdp(2);
        assert_eq!(samples_per_packet(&sdp), 48);

        sdp.framecount = 0;
        sdp.ptime = 4;
        assert_eq!(samples_per_packet(&sdp), 192);

        sdp.sample_rate = 96_000;
        sdp.ptime = 1;
        assert_eq!(samples_per_packet(&sdp), 96);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let rings = new_channel_rings(480);
        let clock = Arc::new(ClockService::new());
        let mapping = ChannelMapping::sequential(StreamId::generate(), "tx", 0, 2);
        let mut tx = RtpTransmitter::new(test_sdp(2), mapping, rings, clock);
        tx.stop();
        tx.stop();
        assert!(!tx.is_running());
    }
}
