//! The virtual AES67 device
//!
//! Top-level object tying the engine together: it owns the 128-channel
//! ring arrays, the real-time host bridge, the clock service, the
//! stream manager and the SAP listener. The host audio shell drives
//! [`IoBridge`]; everything else is control plane.

use std::sync::{Arc, Mutex};

use crate::audio::{new_channel_rings, ChannelRings, IoBridge};
use crate::clock::ClockService;
use crate::discovery::SapListener;
use crate::error::Result;
use crate::stream::StreamManager;
use crate::types::DeviceConfig;

/// A 128-in / 128-out virtual AES67 device
pub struct Aes67Device {
    config: DeviceConfig,
    input_rings: Arc<ChannelRings>,
    output_rings: Arc<ChannelRings>,
    bridge: IoBridge,
    clock: Arc<ClockService>,
    manager: StreamManager,
    sap: Mutex<SapListener>,
}

impl Aes67Device {
    /// Build a device from its configuration
    #[must_use]
    pub fn new(config: DeviceConfig) -> Self {
        let input_rings = new_channel_rings(config.ring_capacity);
        let output_rings = new_channel_rings(config.ring_capacity);

        let clock = Arc::new(ClockService::new());
        clock.set_ptp_enabled(config.ptp_enabled);

        let bridge = IoBridge::new(Arc::clone(&input_rings), Arc::clone(&output_rings));
        let manager = StreamManager::new(
            Arc::clone(&input_rings),
            Arc::clone(&output_rings),
            Arc::clone(&clock),
            config.sample_rate,
            &config.device_uid,
        );
        manager.set_config_path(config.config_path.clone());

        Self {
            config,
            input_rings,
            output_rings,
            bridge,
            clock,
            manager,
            sap: Mutex::new(SapListener::new()),
        }
    }

    /// Start discovery and load saved streams, per configuration
    ///
    /// # Errors
    ///
    /// The SAP join error when discovery is enabled and the group
    /// cannot be joined. A missing saved-stream file is not an error.
    pub fn start(&self) -> Result<()> {
        if self.config.sap_discovery_enabled {
            self.sap
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .start()?;
        }

        if self.config.config_path.is_some() {
            match self.manager.load_streams() {
                Ok(count) if count > 0 => {
                    tracing::debug!("restored {count} saved streams");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("could not restore saved streams: {e}"),
            }
        }
        Ok(())
    }

    /// Stop discovery and tear down every stream
    pub fn stop(&self) {
        self.sap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .stop();
        self.manager.remove_all();
    }

    /// The device configuration
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The real-time host bridge
    #[must_use]
    pub fn bridge(&self) -> &IoBridge {
        &self.bridge
    }

    /// The stream manager
    #[must_use]
    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    /// The clock service
    #[must_use]
    pub fn clock(&self) -> &Arc<ClockService> {
        &self.clock
    }

    /// Run a closure against the SAP listener
    ///
    /// The listener sits behind a mutex because configuration and
    /// queries come from control threads while start/stop comes from
    /// the host shell.
    pub fn with_sap_listener<R>(&self, f: impl FnOnce(&mut SapListener) -> R) -> R {
        let mut sap = self
            .sap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut sap)
    }

    /// The device input rings (network to host)
    #[must_use]
    pub fn input_rings(&self) -> &Arc<ChannelRings> {
        &self.input_rings
    }

    /// The device output rings (host to network)
    #[must_use]
    pub fn output_rings(&self) -> &Arc<ChannelRings> {
        &self.output_rings
    }
}

impl Drop for Aes67Device {
    fn drop(&mut self) {
        self.stop();
    }
}
