//! Stream configuration persistence
//!
//! Streams survive restarts as a JSON document pairing each SDP session
//! with its channel mapping. Parsing goes through `serde_json`; unknown
//! fields are tolerated on read and stripped on write. All fields round
//! trip.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Aes67Error, Result};
use crate::protocol::sdp::SdpSession;
use crate::router::ChannelMapping;

/// Document format version written by this engine
pub const CONFIG_VERSION: &str = "1.0";

/// One persisted stream: descriptor, mapping and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStream {
    /// Whether the stream is brought up on load
    pub enabled: bool,
    /// User-provided description
    #[serde(default)]
    pub description: String,
    /// Seconds since epoch when the stream was added
    #[serde(rename = "createdTimestamp", default)]
    pub created_timestamp: u64,
    /// Seconds since epoch of the last modification
    #[serde(rename = "modifiedTimestamp", default)]
    pub modified_timestamp: u64,
    /// The session descriptor
    pub sdp: SdpSession,
    /// The channel mapping
    pub mapping: ChannelMapping,
}

/// The on-disk stream configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfigFile {
    /// Format version, currently "1.0"
    pub version: String,
    /// Persisted streams
    pub streams: Vec<PersistedStream>,
}

impl StreamConfigFile {
    /// Wrap streams in a current-version document
    #[must_use]
    pub fn new(streams: Vec<PersistedStream>) -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            streams,
        }
    }

    /// Read and parse a configuration file
    ///
    /// # Errors
    ///
    /// `Config` describing the read or parse failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Aes67Error::Config {
            message: format!("cannot read {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        serde_json::from_str(&text).map_err(|e| Aes67Error::Config {
            message: format!("cannot parse {}", path.display()),
            source: Some(Box::new(e)),
        })
    }

    /// Serialize and write the document, creating parent directories
    ///
    /// # Errors
    ///
    /// `Config` describing the write failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Aes67Error::Config {
                    message: format!("cannot create {}", parent.display()),
                    source: Some(Box::new(e)),
                })?;
            }
        }

        let text = serde_json::to_string_pretty(self).map_err(|e| Aes67Error::Config {
            message: "cannot serialize configuration".to_string(),
            source: Some(Box::new(e)),
        })?;
        fs::write(path, text).map_err(|e| Aes67Error::Config {
            message: format!("cannot write {}", path.display()),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::types::{AudioEncoding, StreamId};

    fn sample_stream() -> PersistedStream {
        let sdp = SdpSession::default_tx_session(
            "Persisted TX",
            "10.0.0.5",
            Ipv4Addr::new(239, 7, 7, 7),
            5004,
            8,
            48_000,
            AudioEncoding::L24,
        );
        let mapping = ChannelMapping::sequential(StreamId::generate(), "Persisted TX", 16, 8);
        PersistedStream {
            enabled: true,
            description: "console bus".to_string(),
            created_timestamp: 1_700_000_000,
            modified_timestamp: 1_700_000_100,
            sdp,
            mapping,
        }
    }

    #[test]
    fn test_document_shape() {
        let file = StreamConfigFile::new(vec![sample_stream()]);
        let json = serde_json::to_value(&file).unwrap();

        assert_eq!(json["version"], "1.0");
        let stream = &json["streams"][0];
        assert_eq!(stream["enabled"], true);
        assert_eq!(stream["createdTimestamp"], 1_700_000_000u64);
        assert_eq!(stream["sdp"]["sessionName"], "Persisted TX");
        assert_eq!(stream["sdp"]["numChannels"], 8);
        assert_eq!(stream["mapping"]["deviceChannelStart"], 16);
        assert!(stream["mapping"]["streamID"].is_string());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.json");

        let file = StreamConfigFile::new(vec![sample_stream()]);
        file.save(&path).unwrap();

        let loaded = StreamConfigFile::load(&path).unwrap();
        assert_eq!(loaded, file);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config/streams.json");

        StreamConfigFile::new(Vec::new()).save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = r#"{
            "version": "1.0",
            "futureTopLevel": {},
            "streams": [{
                "enabled": false,
                "description": "",
                "createdTimestamp": 0,
                "modifiedTimestamp": 0,
                "futureField": [1, 2, 3],
                "sdp": {
                    "sessionName": "Tolerant",
                    "connectionAddress": "239.1.2.3",
                    "numChannels": 2
                },
                "mapping": {
                    "streamID": "4f2b0e48-9cc2-4b7f-9a39-31a1a237e2b5",
                    "streamName": "Tolerant",
                    "streamChannelCount": 2,
                    "streamChannelOffset": 0,
                    "deviceChannelStart": 0,
                    "deviceChannelCount": 2
                }
            }]
        }"#;

        let file: StreamConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.streams.len(), 1);
        assert_eq!(file.streams[0].sdp.session_name, "Tolerant");
        assert!(file.streams[0].mapping.channel_map.is_empty());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(matches!(
            StreamConfigFile::load("/nonexistent/streams.json"),
            Err(Aes67Error::Config { .. })
        ));
    }
}
