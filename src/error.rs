//! Error types for AES67 engine operations

use std::io;

use thiserror::Error;

use crate::types::StreamId;

/// Errors surfaced to callers of the engine
///
/// Packet-level faults are never surfaced here; they are counted in the
/// per-stream statistics and the packet is dropped.
#[derive(Debug, Error)]
pub enum Aes67Error {
    // ===== Network Errors =====
    /// Socket create/bind/send/recv failure
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Joining the multicast group failed
    #[error("multicast join failed for {group}: {message}")]
    MulticastJoin {
        /// The group that could not be joined
        group: String,
        /// Description of the failure
        message: String,
    },

    // ===== SDP Errors =====
    /// SDP text could not be parsed
    #[error("SDP parse error: {0}")]
    SdpParse(#[from] SdpParseError),

    /// SDP parsed but failed semantic validation
    #[error("invalid SDP session: {message}")]
    SdpInvalid {
        /// Description of the validation failure
        message: String,
    },

    // ===== Mapping Errors =====
    /// A claimed device channel is already owned by another stream
    #[error("device channel {channel} already owned by stream {owner}")]
    ChannelOverlap {
        /// The contested device channel
        channel: u16,
        /// The stream that owns it
        owner: StreamId,
    },

    /// Mapping references channels outside the device range
    #[error("mapping out of range: {message}")]
    MappingOutOfRange {
        /// Description of the offending range
        message: String,
    },

    /// No contiguous block of free device channels is large enough
    #[error("no {requested} contiguous device channels available")]
    NoChannelsAvailable {
        /// Channels requested
        requested: u16,
    },

    /// The mapping itself is malformed
    #[error("invalid mapping: {message}")]
    MappingInvalid {
        /// Description of the defect
        message: String,
    },

    // ===== Stream Errors =====
    /// No managed stream with this id
    #[error("stream not found: {id}")]
    StreamNotFound {
        /// The id that was looked up
        id: StreamId,
    },

    /// A stream with this id already exists
    #[error("stream already exists: {id}")]
    StreamAlreadyExists {
        /// The duplicate id
        id: StreamId,
    },

    /// Stream sample rate differs from the device rate
    #[error("sample rate mismatch: stream {stream_rate} Hz, device {device_rate} Hz")]
    SampleRateMismatch {
        /// Rate declared by the stream
        stream_rate: u32,
        /// Current device rate
        device_rate: u32,
    },

    /// Stream configuration rejected at admission
    #[error("invalid stream configuration: {message}")]
    StreamInvalid {
        /// Description of the defect
        message: String,
    },

    // ===== Clock Errors =====
    /// PTP domain outside -1..=127
    #[error("invalid PTP domain: {domain}")]
    ClockDomainInvalid {
        /// The offending domain
        domain: i32,
    },

    /// Domain has not achieved lock (informational)
    #[error("PTP domain {domain} not locked")]
    ClockNotLocked {
        /// The queried domain
        domain: i32,
    },

    // ===== Audio Errors =====
    /// Payload encoding not supported by the engine
    #[error("unsupported audio format: {format}")]
    FormatNotSupported {
        /// The unsupported encoding token
        format: String,
    },

    // ===== Generic Errors =====
    /// Invalid parameter provided
    #[error("invalid parameter: {name} - {message}")]
    InvalidParameter {
        /// The name of the parameter
        name: String,
        /// Description of the error
        message: String,
    },

    /// Configuration file could not be read or written
    #[error("config error: {message}")]
    Config {
        /// Description of the failure
        message: String,
        /// The underlying source of the error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Feature not yet implemented
    #[error("not implemented: {feature}")]
    NotImplemented {
        /// The feature that is not implemented
        feature: String,
    },
}

impl Aes67Error {
    /// Check if this error is recoverable by retrying
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ClockNotLocked { .. })
    }

    /// Check if this error came from stream admission (no residual state)
    #[must_use]
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::SdpInvalid { .. }
                | Self::ChannelOverlap { .. }
                | Self::MappingOutOfRange { .. }
                | Self::NoChannelsAvailable { .. }
                | Self::MappingInvalid { .. }
                | Self::StreamAlreadyExists { .. }
                | Self::SampleRateMismatch { .. }
                | Self::StreamInvalid { .. }
        )
    }
}

/// Errors from SDP text parsing
#[derive(Debug, Error)]
pub enum SdpParseError {
    /// Missing or malformed v= line
    #[error("invalid version line")]
    InvalidVersion,

    /// Malformed o= line
    #[error("invalid origin line: {0}")]
    InvalidOrigin(String),

    /// Malformed c= line
    #[error("invalid connection line: {0}")]
    InvalidConnection(String),

    /// Malformed t= line
    #[error("invalid timing line: {0}")]
    InvalidTiming(String),

    /// Malformed m= line
    #[error("invalid media line: {0}")]
    InvalidMedia(String),

    /// Malformed a= line
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A structurally required line was absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Errors from RTP header decoding
#[derive(Debug, Error)]
pub enum RtpDecodeError {
    /// Packet shorter than the fixed header
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Minimum bytes required
        needed: usize,
        /// Bytes actually present
        have: usize,
    },

    /// Version field was not 2
    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    /// Payload type differed from the session's expected value
    #[error("unexpected payload type: {got}, expected {expected}")]
    UnexpectedPayloadType {
        /// Payload type in the packet
        got: u8,
        /// Payload type the session declared
        expected: u8,
    },

    /// Packet exceeded the MTU ceiling
    #[error("packet too large: {size} bytes exceeds MTU {mtu}")]
    PacketTooLarge {
        /// Observed datagram size
        size: usize,
        /// Configured ceiling
        mtu: usize,
    },
}

/// Errors from SAP header parsing
#[derive(Debug, Error)]
pub enum SapParseError {
    /// Datagram shorter than the fixed SAP header
    #[error("SAP packet too short: {0} bytes")]
    TooShort(usize),

    /// Version field was not 1
    #[error("unsupported SAP version: {0}")]
    UnsupportedVersion(u8),

    /// Encrypted announcements are not supported
    #[error("encrypted SAP packet")]
    Encrypted,

    /// Compressed announcements are not supported
    #[error("compressed SAP packet")]
    Compressed,

    /// Announcements from IPv6 origins are not supported
    #[error("IPv6 SAP origin not supported")]
    Ipv6Origin,

    /// Header claimed more bytes than the datagram holds
    #[error("SAP header truncated")]
    Truncated,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Aes67Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Aes67Error::SampleRateMismatch {
            stream_rate: 44_100,
            device_rate: 48_000,
        };
        assert_eq!(
            err.to_string(),
            "sample rate mismatch: stream 44100 Hz, device 48000 Hz"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: Aes67Error = io_err.into();
        assert!(matches!(err, Aes67Error::Network(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_admission_error_classification() {
        let err = Aes67Error::NoChannelsAvailable { requested: 8 };
        assert!(err.is_admission_error());
        assert!(!err.is_recoverable());

        let err = Aes67Error::Network(io::Error::new(io::ErrorKind::Other, "x"));
        assert!(!err.is_admission_error());
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Aes67Error>();
    }
}
