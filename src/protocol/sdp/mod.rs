//! SDP session descriptions (RFC 4566, AES67 profile)
//!
//! The normalized descriptor for every stream the engine handles,
//! whether read from a file, announced over SAP, or built for a
//! transmitter. Parsing accepts the Riedel Artist dialect of AES67 SDP.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Aes67Error, Result};
use crate::types::{AudioEncoding, Direction, NetworkAddress, PtpConfig, StreamId, StreamInfo};

mod builder;
mod parser;

pub use builder::emit;
pub use parser::parse;

/// A normalized AES67 SDP session description
///
/// Field names in the serialized (configuration) form follow the wire
/// contract of the persisted stream document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdpSession {
    /// Session name (s=), required and non-empty
    #[serde(rename = "sessionName")]
    pub session_name: String,
    /// Free-form session information (i=), empty when absent
    #[serde(rename = "sessionInfo")]
    pub session_info: String,
    /// Origin session id (o=)
    #[serde(rename = "sessionID")]
    pub session_id: u64,
    /// Origin session version (o=)
    #[serde(rename = "sessionVersion")]
    pub session_version: u64,
    /// Origin username (o=), conventionally "-"
    #[serde(rename = "originUsername")]
    pub origin_username: String,
    /// Origin unicast address (o=)
    #[serde(rename = "originAddress")]
    pub origin_address: String,
    /// Connection (multicast) address (c=)
    #[serde(rename = "connectionAddress")]
    pub connection_address: Ipv4Addr,
    /// Multicast TTL from the connection line
    pub ttl: u8,
    /// Session start time (t=)
    #[serde(rename = "timeStart")]
    pub time_start: u64,
    /// Session stop time (t=)
    #[serde(rename = "timeStop")]
    pub time_stop: u64,
    /// UDP port (m=)
    pub port: u16,
    /// RTP payload type (m=)
    #[serde(rename = "payloadType")]
    pub payload_type: u8,
    /// Audio encoding from rtpmap
    pub encoding: AudioEncoding,
    /// Sample rate in Hz from rtpmap
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    /// Channel count from rtpmap
    #[serde(rename = "numChannels")]
    pub num_channels: u16,
    /// Packet time in milliseconds (a=ptime)
    pub ptime: u32,
    /// Samples per packet (a=framecount)
    pub framecount: u32,
    /// Unicast source address (a=source-filter), if announced
    #[serde(rename = "sourceAddress", skip_serializing_if = "Option::is_none")]
    pub source_address: Option<Ipv4Addr>,
    /// PTP domain (a=ts-refclk); -1 means no PTP reference
    #[serde(rename = "ptpDomain")]
    pub ptp_domain: i32,
    /// PTP grandmaster MAC (a=ts-refclk)
    #[serde(rename = "ptpMasterMAC")]
    pub ptp_master_mac: String,
    /// Media clock reference (a=mediaclk)
    #[serde(rename = "mediaClockType")]
    pub media_clock: String,
    /// Stream direction tag
    pub direction: Direction,
    /// Attributes not recognized by the parser, preserved verbatim
    #[serde(rename = "customAttributes", skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Default for SdpSession {
    fn default() -> Self {
        Self {
            session_name: String::new(),
            session_info: String::new(),
            session_id: 0,
            session_version: 0,
            origin_username: "-".to_string(),
            origin_address: String::new(),
            connection_address: Ipv4Addr::UNSPECIFIED,
            ttl: 32,
            time_start: 0,
            time_stop: 0,
            port: 5004,
            payload_type: 96,
            encoding: AudioEncoding::L24,
            sample_rate: 48_000,
            num_channels: 2,
            ptime: 1,
            framecount: 48,
            source_address: None,
            ptp_domain: 0,
            ptp_master_mac: String::new(),
            media_clock: "direct=0".to_string(),
            direction: Direction::RecvOnly,
            attributes: BTreeMap::new(),
        }
    }
}

impl SdpSession {
    /// Validation errors for this session, empty when valid
    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.session_name.is_empty() {
            errors.push("session name is empty".to_string());
        }
        if self.connection_address.is_unspecified() {
            errors.push("connection address missing".to_string());
        }
        if self.port == 0 {
            errors.push("port is zero".to_string());
        }
        if self.encoding == AudioEncoding::Unknown {
            errors.push("unknown encoding".to_string());
        }
        if self.sample_rate == 0 {
            errors.push("sample rate is zero".to_string());
        }
        if self.num_channels == 0 {
            errors.push("channel count is zero".to_string());
        }
        if self.ptp_domain < -1 || self.ptp_domain > 127 {
            errors.push(format!("PTP domain {} out of range", self.ptp_domain));
        }

        errors
    }

    /// Check whether the session passes post-parse validation
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }

    /// The multicast endpoint this session describes
    #[must_use]
    pub fn multicast(&self) -> NetworkAddress {
        NetworkAddress {
            ip: self.connection_address,
            port: self.port,
            ttl: self.ttl,
        }
    }

    /// Wire bytes per packet payload for this session
    #[must_use]
    pub fn payload_bytes_per_packet(&self) -> usize {
        self.framecount as usize * self.num_channels as usize * self.encoding.bytes_per_sample()
    }

    /// Build the default session for a new transmit stream
    ///
    /// Encoding defaults follow AES67 conventions: payload type 97 for
    /// L24, 96 otherwise; 1 ms packet time with `sample_rate / 1000`
    /// samples per packet.
    #[must_use]
    pub fn default_tx_session(
        name: &str,
        origin: &str,
        multicast: Ipv4Addr,
        port: u16,
        num_channels: u16,
        sample_rate: u32,
        encoding: AudioEncoding,
    ) -> Self {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            session_name: name.to_string(),
            session_id: now_secs,
            session_version: now_secs,
            origin_address: origin.to_string(),
            connection_address: multicast,
            port,
            payload_type: match encoding {
                AudioEncoding::L24 => crate::protocol::rtp::PT_L24,
                _ => crate::protocol::rtp::PT_L16,
            },
            encoding,
            sample_rate,
            num_channels,
            ptime: 1,
            framecount: sample_rate / 1000,
            direction: Direction::SendOnly,
            ..Default::default()
        }
    }

    /// Convert to the observable stream record
    #[must_use]
    pub fn to_stream_info(&self, id: StreamId) -> StreamInfo {
        StreamInfo {
            id,
            name: self.session_name.clone(),
            multicast: self.multicast(),
            source: self.source_address,
            encoding: self.encoding,
            sample_rate: self.sample_rate,
            channels: self.num_channels,
            payload_type: self.payload_type,
            ptime_ms: self.ptime,
            frame_count: self.framecount,
            ptp: PtpConfig {
                domain: self.ptp_domain,
                master_mac: self.ptp_master_mac.clone(),
                enabled: self.ptp_domain >= 0,
            },
            is_transmit: self.direction == Direction::SendOnly,
            is_active: false,
            is_connected: false,
            start_time: None,
            stats: crate::types::StatsSnapshot::default(),
        }
    }

    /// Rebuild a session descriptor from an observable stream record
    #[must_use]
    pub fn from_stream_info(info: &StreamInfo) -> Self {
        Self {
            session_name: info.name.clone(),
            connection_address: info.multicast.ip,
            ttl: info.multicast.ttl,
            port: info.multicast.port,
            payload_type: info.payload_type,
            encoding: info.encoding,
            sample_rate: info.sample_rate,
            num_channels: info.channels,
            ptime: info.ptime_ms,
            framecount: info.frame_count,
            source_address: info.source,
            ptp_domain: info.ptp.domain,
            ptp_master_mac: info.ptp.master_mac.clone(),
            direction: if info.is_transmit {
                Direction::SendOnly
            } else {
                Direction::RecvOnly
            },
            ..Default::default()
        }
    }

    /// Parse a session from an SDP file on disk
    ///
    /// # Errors
    ///
    /// Returns a network error when the file cannot be read, or the
    /// parse/validation error for malformed content.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Aes67Error::Network)?;
        parse(&text)
    }

    /// Write the emitted SDP text to a file
    ///
    /// # Errors
    ///
    /// Returns a network error when the file cannot be written.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, emit(self)).map_err(Aes67Error::Network)
    }
}
