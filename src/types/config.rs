//! Device-level configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Static configuration for the virtual AES67 device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device sample rate in Hz
    pub sample_rate: u32,
    /// Host I/O buffer size in frames
    pub buffer_size: u32,
    /// Capacity of each device channel ring, in samples
    pub ring_capacity: usize,
    /// Whether PTP domain workers are started
    pub ptp_enabled: bool,
    /// Whether the SAP listener is started
    pub sap_discovery_enabled: bool,
    /// Human-readable device name (used as SDP origin username hint)
    pub device_name: String,
    /// Manufacturer string
    pub manufacturer: String,
    /// Stable device identifier, used as the SDP origin for TX sessions
    pub device_uid: String,
    /// Where stream configurations are persisted; `None` disables saving
    pub config_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 64,
            // Enough for 1 ms at 384 kHz
            ring_capacity: 480,
            ptp_enabled: true,
            sap_discovery_enabled: true,
            device_name: "AES67 Device".to_string(),
            manufacturer: "aes67-rs".to_string(),
            device_uid: "AES67-Device-001".to_string(),
            config_path: None,
        }
    }
}

impl DeviceConfig {
    /// Sanity-check the configuration
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.buffer_size > 0
            && self.ring_capacity > 0
            && !self.device_uid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.is_valid());
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.ring_capacity, 480);
    }

    #[test]
    fn test_zero_rate_is_invalid() {
        let config = DeviceConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(!config.is_valid());
    }
}
