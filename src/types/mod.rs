//! Core types shared across the engine

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod config;

pub use config::DeviceConfig;

/// Number of device channels exposed to the host
pub const MAX_DEVICE_CHANNELS: usize = 128;

/// Hard ceiling on frames per RTP packet (and per RT callback batch)
pub const MAX_FRAMES_PER_PACKET: usize = 512;

/// Unique identifier for a stream
///
/// A 128-bit value, generated as a version-4 UUID. Equality and ordering
/// are defined on the byte array; the all-zero value is the distinguished
/// null id used for unassigned router slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// The null (all-zero) stream id
    #[must_use]
    pub const fn null() -> Self {
        Self(Uuid::nil())
    }

    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check whether this is the null id
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    /// Raw byte representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Audio payload encodings used by AES67 streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// 16-bit big-endian linear PCM
    L16,
    /// 24-bit big-endian linear PCM
    L24,
    /// AES3 audio wrapped in 32-bit subframes
    AM824,
    /// Unrecognized encoding token
    Unknown,
}

impl AudioEncoding {
    /// Bytes per single sample on the wire
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioEncoding::L16 => 2,
            AudioEncoding::L24 => 3,
            AudioEncoding::AM824 => 4,
            AudioEncoding::Unknown => 0,
        }
    }

    /// Parse an SDP rtpmap encoding token
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        match token {
            "L16" => AudioEncoding::L16,
            "L24" => AudioEncoding::L24,
            "AM824" => AudioEncoding::AM824,
            _ => AudioEncoding::Unknown,
        }
    }

    /// The SDP rtpmap token for this encoding
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AudioEncoding::L16 => "L16",
            AudioEncoding::L24 => "L24",
            AudioEncoding::AM824 => "AM824",
            AudioEncoding::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream direction tag from SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote end transmits; we receive
    #[default]
    RecvOnly,
    /// We transmit
    SendOnly,
    /// Bidirectional
    SendRecv,
    /// Declared but not flowing
    Inactive,
}

impl Direction {
    /// The SDP attribute name for this direction
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::RecvOnly => "recvonly",
            Direction::SendOnly => "sendonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        }
    }

    /// Parse an SDP direction attribute name
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "recvonly" => Some(Direction::RecvOnly),
            "sendonly" => Some(Direction::SendOnly),
            "sendrecv" => Some(Direction::SendRecv),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// A multicast (or unicast) endpoint with TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// UDP port
    pub port: u16,
    /// Multicast TTL
    pub ttl: u8,
}

impl NetworkAddress {
    /// Create an address with the AES67 default TTL of 32
    #[must_use]
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port, ttl: 32 }
    }

    /// Non-zero port and non-unspecified address
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.port != 0 && !self.ip.is_unspecified()
    }

    /// Any multicast address (224.0.0.0/4)
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.ip.is_multicast()
    }

    /// Administratively scoped multicast required by AES67 (239.0.0.0/8)
    #[must_use]
    pub fn is_aes67_multicast(&self) -> bool {
        self.ip.octets()[0] == 239
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// PTP synchronization parameters for a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtpConfig {
    /// PTP domain number; -1 means the stream carries no PTP reference
    pub domain: i32,
    /// Grandmaster MAC address as announced in SDP
    pub master_mac: String,
    /// Whether PTP timing should be used for this stream
    pub enabled: bool,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            domain: 0,
            master_mac: String::new(),
            enabled: true,
        }
    }
}

impl PtpConfig {
    /// Valid domains are -1 (none) or 0..=127
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.domain >= -1 && self.domain <= 127
    }
}

fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Per-stream statistics counters
///
/// All counters are atomics updated with relaxed ordering from the
/// pipeline threads; readers take a [`StatsSnapshot`]. Send failures on
/// the transmit path are counted in `malformed_packets`.
#[derive(Debug, Default)]
pub struct Statistics {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_lost: AtomicU64,
    malformed_packets: AtomicU64,
    out_of_order_packets: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    /// Interarrival jitter estimate in nanoseconds (gauge, not counter)
    jitter_nanos: AtomicU64,
    /// Monotonic nanos of the last packet, 0 = never
    last_packet_nanos: AtomicU64,
}

impl Statistics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one received packet of `bytes` and stamp the packet time
    pub fn record_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.last_packet_nanos
            .store(monotonic_nanos(), Ordering::Relaxed);
    }

    /// Record one sent packet of `bytes`
    pub fn record_sent(&self, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.last_packet_nanos
            .store(monotonic_nanos(), Ordering::Relaxed);
    }

    /// Add `n` to the lost-packet counter
    pub fn add_lost(&self, n: u64) {
        self.packets_lost.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one malformed packet (or, on the transmit path, a send error)
    pub fn incr_malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet that arrived behind the expected sequence
    pub fn incr_out_of_order(&self) {
        self.out_of_order_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one ring underrun event
    pub fn incr_underruns(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one ring overrun event
    pub fn incr_overruns(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the latest interarrival jitter estimate
    pub fn set_jitter(&self, nanos: u64) {
        self.jitter_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Time since the last packet, `None` if none was ever seen
    #[must_use]
    pub fn time_since_last_packet(&self) -> Option<Duration> {
        let last = self.last_packet_nanos.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(Duration::from_nanos(
            monotonic_nanos().saturating_sub(last),
        ))
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
        self.malformed_packets.store(0, Ordering::Relaxed);
        self.out_of_order_packets.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.jitter_nanos.store(0, Ordering::Relaxed);
        self.last_packet_nanos.store(0, Ordering::Relaxed);
    }

    /// Take a copy of all counters for monitoring
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            out_of_order_packets: self.out_of_order_packets.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            jitter_nanos: self.jitter_nanos.load(Ordering::Relaxed),
            time_since_last_packet: self.time_since_last_packet(),
        }
    }
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Packets received
    pub packets_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets lost, derived from sequence gaps
    pub packets_lost: u64,
    /// Malformed packets dropped (also counts transmit send errors)
    pub malformed_packets: u64,
    /// Packets that arrived behind the expected sequence
    pub out_of_order_packets: u64,
    /// Ring underrun events
    pub underruns: u64,
    /// Ring overrun events
    pub overruns: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Interarrival jitter estimate in nanoseconds
    pub jitter_nanos: u64,
    /// Time since the last packet in either direction
    pub time_since_last_packet: Option<Duration>,
}

impl StatsSnapshot {
    /// Packet loss as a percentage of expected packets
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        reason = "precision loss acceptable for a monitoring ratio"
    )]
    pub fn packet_loss_percent(&self) -> f64 {
        let expected = self.packets_received + self.packets_lost;
        if expected == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / expected as f64 * 100.0
    }
}

/// Observable state of a managed stream
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream id
    pub id: StreamId,
    /// Session name from SDP
    pub name: String,
    /// Multicast group and port
    pub multicast: NetworkAddress,
    /// Unicast source filter, if announced
    pub source: Option<Ipv4Addr>,
    /// Payload encoding
    pub encoding: AudioEncoding,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// RTP payload type
    pub payload_type: u8,
    /// Packet time in milliseconds
    pub ptime_ms: u32,
    /// Samples per packet
    pub frame_count: u32,
    /// PTP parameters
    pub ptp: PtpConfig,
    /// True for transmit streams
    pub is_transmit: bool,
    /// Pipeline running
    pub is_active: bool,
    /// Packet seen within the last second (receive streams)
    pub is_connected: bool,
    /// When the pipeline started
    pub start_time: Option<Instant>,
    /// Counters at snapshot time
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_null_and_generate() {
        assert!(StreamId::null().is_null());
        assert_eq!(StreamId::default(), StreamId::null());

        let a = StreamId::generate();
        let b = StreamId::generate();
        assert!(!a.is_null());
        assert_ne!(a, b);
    }

    #[test]
    fn test_stream_id_round_trips_through_string() {
        let id = StreamId::generate();
        let parsed: StreamId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_stream_id_ordering_is_on_bytes() {
        let mut ids: Vec<StreamId> = (0..8).map(|_| StreamId::generate()).collect();
        ids.sort();
        for pair in ids.windows(2) {
            assert!(pair[0].as_bytes() <= pair[1].as_bytes());
        }
    }

    #[test]
    fn test_encoding_tokens() {
        assert_eq!(AudioEncoding::from_token("L16"), AudioEncoding::L16);
        assert_eq!(AudioEncoding::from_token("L24"), AudioEncoding::L24);
        assert_eq!(AudioEncoding::from_token("AM824"), AudioEncoding::AM824);
        assert_eq!(AudioEncoding::from_token("opus"), AudioEncoding::Unknown);

        assert_eq!(AudioEncoding::L16.bytes_per_sample(), 2);
        assert_eq!(AudioEncoding::L24.bytes_per_sample(), 3);
    }

    #[test]
    fn test_direction_tokens() {
        for dir in [
            Direction::RecvOnly,
            Direction::SendOnly,
            Direction::SendRecv,
            Direction::Inactive,
        ] {
            assert_eq!(Direction::from_token(dir.as_str()), Some(dir));
        }
        assert_eq!(Direction::from_token("duplex"), None);
    }

    #[test]
    fn test_network_address_multicast_ranges() {
        let aes67 = NetworkAddress::new(Ipv4Addr::new(239, 1, 2, 3), 5004);
        assert!(aes67.is_valid());
        assert!(aes67.is_multicast());
        assert!(aes67.is_aes67_multicast());

        let other_mcast = NetworkAddress::new(Ipv4Addr::new(224, 0, 1, 1), 5004);
        assert!(other_mcast.is_multicast());
        assert!(!other_mcast.is_aes67_multicast());

        let unicast = NetworkAddress::new(Ipv4Addr::new(192, 168, 1, 10), 5004);
        assert!(!unicast.is_multicast());

        let no_port = NetworkAddress::new(Ipv4Addr::new(239, 1, 1, 1), 0);
        assert!(!no_port.is_valid());
    }

    #[test]
    fn test_ptp_config_domain_range() {
        assert!(PtpConfig::default().is_valid());
        assert!(PtpConfig {
            domain: -1,
            ..Default::default()
        }
        .is_valid());
        assert!(!PtpConfig {
            domain: 128,
            ..Default::default()
        }
        .is_valid());
    }

    #[test]
    fn test_statistics_counters() {
        let stats = Statistics::new();
        stats.record_received(288);
        stats.record_received(288);
        stats.add_lost(3);
        stats.incr_malformed();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.bytes_received, 576);
        assert_eq!(snap.packets_lost, 3);
        assert_eq!(snap.malformed_packets, 1);
        assert!(snap.time_since_last_packet.is_some());

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 0);
        assert_eq!(snap.time_since_last_packet, None);
    }

    #[test]
    fn test_packet_loss_percent() {
        let snap = StatsSnapshot {
            packets_received: 90,
            packets_lost: 10,
            ..Default::default()
        };
        assert!((snap.packet_loss_percent() - 10.0).abs() < f64::EPSILON);

        assert!((StatsSnapshot::default().packet_loss_percent()).abs() < f64::EPSILON);
    }
}
