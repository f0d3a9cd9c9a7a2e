//! Stream lifecycle management
//!
//! The only admission path for receivers and transmitters. Every add
//! validates against the device sample rate, the channel budget and the
//! network configuration, reserves router slots, and builds and starts
//! the pipeline; any failure unwinds the earlier steps in reverse
//! order. Observer callbacks fire outside the manager mutex.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::audio::ChannelRings;
use crate::clock::ClockService;
use crate::config::{PersistedStream, StreamConfigFile};
use crate::error::{Aes67Error, Result};
use crate::protocol::sdp::SdpSession;
use crate::router::{ChannelMapping, ChannelRouter};
use crate::stream::{RtpReceiver, RtpTransmitter};
use crate::types::{AudioEncoding, Direction, StreamId, StreamInfo};

/// Observer callback for stream lifecycle events
pub type StreamCallback = Box<dyn Fn(&StreamInfo) + Send + Sync>;

/// Exactly one pipeline per managed stream
enum Pipeline {
    Receiver(RtpReceiver),
    Transmitter(RtpTransmitter),
}

impl Pipeline {
    fn stop(&mut self) {
        match self {
            Pipeline::Receiver(rx) => rx.stop(),
            Pipeline::Transmitter(tx) => tx.stop(),
        }
    }

    fn update_mapping(&mut self, mapping: ChannelMapping) -> Result<()> {
        match self {
            Pipeline::Receiver(rx) => rx.update_mapping(mapping),
            Pipeline::Transmitter(tx) => tx.update_mapping(mapping),
        }
    }

    fn mapping(&self) -> &ChannelMapping {
        match self {
            Pipeline::Receiver(rx) => rx.mapping(),
            Pipeline::Transmitter(tx) => tx.mapping(),
        }
    }

    fn is_transmit(&self) -> bool {
        matches!(self, Pipeline::Transmitter(_))
    }
}

struct ManagedStream {
    sdp: SdpSession,
    pipeline: Pipeline,
    start_time: Instant,
    created_timestamp: u64,
}

impl ManagedStream {
    fn info(&self, id: StreamId) -> StreamInfo {
        let mut info = self.sdp.to_stream_info(id);
        info.is_transmit = self.pipeline.is_transmit();
        info.start_time = Some(self.start_time);
        match &self.pipeline {
            Pipeline::Receiver(rx) => {
                info.is_active = rx.is_running();
                info.is_connected = rx.is_connected();
                info.stats = rx.statistics();
            }
            Pipeline::Transmitter(tx) => {
                info.is_active = tx.is_running();
                info.is_connected = tx.is_running();
                info.stats = tx.statistics();
            }
        }
        info
    }
}

/// Central coordinator for all AES67 streams
pub struct StreamManager {
    router: ChannelRouter,
    input_rings: Arc<ChannelRings>,
    output_rings: Arc<ChannelRings>,
    clock: Arc<ClockService>,
    streams: Mutex<BTreeMap<StreamId, ManagedStream>>,
    device_sample_rate: AtomicU32,
    device_uid: String,
    config_path: Mutex<Option<PathBuf>>,
    auto_save: std::sync::atomic::AtomicBool,
    on_added: Mutex<Option<StreamCallback>>,
    on_removed: Mutex<Option<StreamCallback>>,
    on_status: Mutex<Option<StreamCallback>>,
}

impl StreamManager {
    /// Create a manager over the device ring arrays
    #[must_use]
    pub fn new(
        input_rings: Arc<ChannelRings>,
        output_rings: Arc<ChannelRings>,
        clock: Arc<ClockService>,
        sample_rate: u32,
        device_uid: &str,
    ) -> Self {
        Self {
            router: ChannelRouter::new(),
            input_rings,
            output_rings,
            clock,
            streams: Mutex::new(BTreeMap::new()),
            device_sample_rate: AtomicU32::new(sample_rate),
            device_uid: device_uid.to_string(),
            config_path: Mutex::new(None),
            auto_save: std::sync::atomic::AtomicBool::new(false),
            on_added: Mutex::new(None),
            on_removed: Mutex::new(None),
            on_status: Mutex::new(None),
        }
    }

    // ===== Callbacks =====

    /// Register the stream-added observer
    pub fn set_stream_added_callback(&self, callback: StreamCallback) {
        *lock(&self.on_added) = Some(callback);
    }

    /// Register the stream-removed observer
    pub fn set_stream_removed_callback(&self, callback: StreamCallback) {
        *lock(&self.on_removed) = Some(callback);
    }

    /// Register the stream-status observer
    pub fn set_stream_status_callback(&self, callback: StreamCallback) {
        *lock(&self.on_status) = Some(callback);
    }

    // ===== RX admission =====

    /// Add a receive stream with automatic channel allocation
    ///
    /// # Errors
    ///
    /// `NoChannelsAvailable` when no contiguous block fits, otherwise
    /// the same errors as [`add_rx_mapped`](Self::add_rx_mapped).
    pub fn add_rx(&self, sdp: SdpSession) -> Result<StreamId> {
        let id = StreamId::generate();
        let mapping = self
            .router
            .default_mapping(id, &sdp.session_name, sdp.num_channels)?;
        self.admit(sdp, mapping, false)
    }

    /// Add a receive stream with an explicit mapping
    ///
    /// The mapping's id, name and counts are completed from the session
    /// before validation.
    ///
    /// # Errors
    ///
    /// Admission errors leave no residual state: router slots, pipeline
    /// and managed record are unwound in reverse order.
    pub fn add_rx_mapped(&self, sdp: SdpSession, mapping: ChannelMapping) -> Result<StreamId> {
        self.admit(sdp, mapping, false)
    }

    /// Import an SDP file and add it as a receive stream
    ///
    /// # Errors
    ///
    /// File, parse or admission errors.
    pub fn import_sdp_file(&self, path: impl AsRef<Path>) -> Result<StreamId> {
        let sdp = SdpSession::from_file(path)?;
        self.add_rx(sdp)
    }

    // ===== TX admission =====

    /// Create a transmit stream from device defaults
    ///
    /// The session is built from the current device sample rate with
    /// L24 encoding, payload type 97, 1 ms packet time and the device
    /// uid as origin. A `None` mapping auto-allocates.
    ///
    /// # Errors
    ///
    /// Same unwinding semantics as RX admission.
    pub fn add_tx(
        &self,
        name: &str,
        multicast: Ipv4Addr,
        port: u16,
        num_channels: u16,
        mapping: Option<ChannelMapping>,
    ) -> Result<StreamId> {
        let sdp = SdpSession::default_tx_session(
            name,
            &self.device_uid,
            multicast,
            port,
            num_channels,
            self.device_sample_rate(),
            AudioEncoding::L24,
        );

        let mapping = match mapping {
            Some(mapping) => mapping,
            None => {
                let id = StreamId::generate();
                self.router.default_mapping(id, name, num_channels)?
            }
        };
        self.admit(sdp, mapping, true)
    }

    /// Export a managed stream's SDP to a file
    ///
    /// # Errors
    ///
    /// `StreamNotFound` or the file error.
    pub fn export_sdp_file(&self, id: StreamId, path: impl AsRef<Path>) -> Result<()> {
        let streams = lock(&self.streams);
        let stream = streams
            .get(&id)
            .ok_or(Aes67Error::StreamNotFound { id })?;
        stream.sdp.write_file(path)
    }

    // ===== Shared admission path =====

    fn admit(&self, sdp: SdpSession, mut mapping: ChannelMapping, is_tx: bool) -> Result<StreamId> {
        let mut streams = lock(&self.streams);

        self.can_add_locked(&sdp)?;

        // Complete the mapping from the session
        let id = if mapping.stream_id.is_null() {
            StreamId::generate()
        } else {
            mapping.stream_id
        };
        mapping.stream_id = id;
        if mapping.stream_name.is_empty() {
            mapping.stream_name.clone_from(&sdp.session_name);
        }
        if mapping.stream_channel_count == 0 {
            mapping.stream_channel_count = sdp.num_channels;
            mapping.device_channel_count = sdp.num_channels;
        }

        if streams.contains_key(&id) {
            return Err(Aes67Error::StreamAlreadyExists { id });
        }

        self.router.add(mapping.clone())?;

        let pipeline = if is_tx {
            let mut tx = RtpTransmitter::new(
                sdp.clone(),
                mapping,
                Arc::clone(&self.output_rings),
                Arc::clone(&self.clock),
            );
            if let Err(e) = tx.start() {
                // Unwind the router reservation
                let _ = self.router.remove(id);
                return Err(e);
            }
            Pipeline::Transmitter(tx)
        } else {
            let mut rx =
                RtpReceiver::new(sdp.clone(), mapping, Arc::clone(&self.input_rings));
            if let Err(e) = rx.start() {
                let _ = self.router.remove(id);
                return Err(e);
            }
            Pipeline::Receiver(rx)
        };

        if sdp.ptp_domain >= 0 && self.clock.is_ptp_enabled() {
            let _ = self.clock.ensure_domain(sdp.ptp_domain);
        }

        let managed = ManagedStream {
            sdp,
            pipeline,
            start_time: Instant::now(),
            created_timestamp: epoch_seconds(),
        };
        let info = managed.info(id);
        streams.insert(id, managed);
        drop(streams);

        tracing::debug!("stream {id} admitted ({})", info.name);
        if let Some(callback) = lock(&self.on_added).as_ref() {
            callback(&info);
        }
        self.auto_save_if_enabled();

        Ok(id)
    }

    /// Check whether a session could currently be admitted
    ///
    /// # Errors
    ///
    /// The admission error the session would fail with.
    pub fn can_add(&self, sdp: &SdpSession) -> Result<()> {
        let _streams = lock(&self.streams);
        self.can_add_locked(sdp)
    }

    fn can_add_locked(&self, sdp: &SdpSession) -> Result<()> {
        let errors = sdp.validation_errors();
        if !errors.is_empty() {
            return Err(Aes67Error::SdpInvalid {
                message: errors.join("; "),
            });
        }

        let device_rate = self.device_sample_rate();
        if sdp.sample_rate != device_rate {
            return Err(Aes67Error::SampleRateMismatch {
                stream_rate: sdp.sample_rate,
                device_rate,
            });
        }

        if !sdp.multicast().is_aes67_multicast() {
            return Err(Aes67Error::StreamInvalid {
                message: format!(
                    "{} is not in the AES67 multicast range 239.0.0.0/8",
                    sdp.connection_address
                ),
            });
        }
        if sdp.port == 0 {
            return Err(Aes67Error::StreamInvalid {
                message: "port is zero".to_string(),
            });
        }

        if !matches!(sdp.encoding, AudioEncoding::L16 | AudioEncoding::L24) {
            return Err(Aes67Error::FormatNotSupported {
                format: sdp.encoding.to_string(),
            });
        }

        if usize::from(sdp.num_channels) > self.router.free_channels() {
            return Err(Aes67Error::NoChannelsAvailable {
                requested: sdp.num_channels,
            });
        }

        Ok(())
    }

    // ===== Mapping updates =====

    /// Re-route a stream to a new mapping
    ///
    /// Router state is updated first, then the pipeline is re-targeted
    /// (stop, re-map, restart). If the pipeline restart fails the
    /// router reverts to the previous mapping.
    ///
    /// # Errors
    ///
    /// `StreamNotFound`, validation or overlap errors, or the restart
    /// error.
    pub fn update_mapping(&self, id: StreamId, mut mapping: ChannelMapping) -> Result<()> {
        let mut streams = lock(&self.streams);
        let stream = streams
            .get_mut(&id)
            .ok_or(Aes67Error::StreamNotFound { id })?;

        mapping.stream_id = id;
        if mapping.stream_name.is_empty() {
            mapping.stream_name.clone_from(&stream.sdp.session_name);
        }

        let previous = stream.pipeline.mapping().clone();
        self.router.update(mapping.clone())?;

        if let Err(e) = stream.pipeline.update_mapping(mapping) {
            let _ = self.router.update(previous.clone());
            let _ = stream.pipeline.update_mapping(previous);
            return Err(e);
        }

        let info = stream.info(id);
        drop(streams);

        if let Some(callback) = lock(&self.on_status).as_ref() {
            callback(&info);
        }
        self.auto_save_if_enabled();
        Ok(())
    }

    /// The mapping for a managed stream
    #[must_use]
    pub fn mapping(&self, id: StreamId) -> Option<ChannelMapping> {
        self.router.get(id)
    }

    /// All mappings
    #[must_use]
    pub fn all_mappings(&self) -> Vec<ChannelMapping> {
        self.router.all()
    }

    // ===== Removal =====

    /// Stop a stream and release its channels
    ///
    /// Teardown is symmetric to admission: stop pipeline, release
    /// router slots, drop the record.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` for an unknown id.
    pub fn remove(&self, id: StreamId) -> Result<()> {
        let mut streams = lock(&self.streams);
        let mut stream = streams
            .remove(&id)
            .ok_or(Aes67Error::StreamNotFound { id })?;

        stream.pipeline.stop();
        let _ = self.router.remove(id);
        let info = stream.info(id);
        drop(streams);

        tracing::debug!("stream {id} removed");
        if let Some(callback) = lock(&self.on_removed).as_ref() {
            callback(&info);
        }
        self.auto_save_if_enabled();
        Ok(())
    }

    /// Stop and remove every stream
    pub fn remove_all(&self) {
        let ids: Vec<StreamId> = lock(&self.streams).keys().copied().collect();
        for id in ids {
            let _ = self.remove(id);
        }
    }

    // ===== Queries =====

    /// Observable state of one stream
    #[must_use]
    pub fn stream_info(&self, id: StreamId) -> Option<StreamInfo> {
        lock(&self.streams).get(&id).map(|stream| stream.info(id))
    }

    /// Observable state of every managed stream
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamInfo> {
        lock(&self.streams)
            .iter()
            .map(|(id, stream)| stream.info(*id))
            .collect()
    }

    /// Whether a stream with this id is managed
    #[must_use]
    pub fn has_stream(&self, id: StreamId) -> bool {
        lock(&self.streams).contains_key(&id)
    }

    /// Number of managed streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Free device channels
    #[must_use]
    pub fn available_channels(&self) -> usize {
        self.router.free_channels()
    }

    /// The channel router (control-plane queries)
    #[must_use]
    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    // ===== Device state =====

    /// Current device sample rate in Hz
    #[must_use]
    pub fn device_sample_rate(&self) -> u32 {
        self.device_sample_rate.load(Ordering::Acquire)
    }

    /// Change the device sample rate
    ///
    /// # Errors
    ///
    /// `SampleRateMismatch` naming the first live stream whose declared
    /// rate differs; the device rate is unchanged in that case.
    pub fn set_device_sample_rate(&self, rate: u32) -> Result<()> {
        let streams = lock(&self.streams);
        for stream in streams.values() {
            if stream.sdp.sample_rate != rate {
                return Err(Aes67Error::SampleRateMismatch {
                    stream_rate: stream.sdp.sample_rate,
                    device_rate: rate,
                });
            }
        }
        self.device_sample_rate.store(rate, Ordering::Release);
        Ok(())
    }

    // ===== Persistence =====

    /// Set where stream configurations are saved and loaded
    pub fn set_config_path(&self, path: Option<PathBuf>) {
        *lock(&self.config_path) = path;
    }

    /// Enable or disable saving after every add/remove/update
    pub fn set_auto_save(&self, enabled: bool) {
        self.auto_save.store(enabled, Ordering::Release);
    }

    /// Save all managed streams to the configured path
    ///
    /// # Errors
    ///
    /// `Config` when no path is set or the write fails.
    pub fn save_streams(&self) -> Result<()> {
        let path = lock(&self.config_path)
            .clone()
            .ok_or_else(|| Aes67Error::Config {
                message: "no configuration path set".to_string(),
                source: None,
            })?;

        let streams = lock(&self.streams);
        let persisted: Vec<PersistedStream> = streams
            .values()
            .map(|stream| PersistedStream {
                enabled: true,
                description: stream.sdp.session_info.clone(),
                created_timestamp: stream.created_timestamp,
                modified_timestamp: epoch_seconds(),
                sdp: stream.sdp.clone(),
                mapping: stream.pipeline.mapping().clone(),
            })
            .collect();
        drop(streams);

        StreamConfigFile::new(persisted).save(&path)
    }

    /// Load saved streams and admit each enabled one
    ///
    /// Entries that fail admission are skipped with a warning; returns
    /// the number of streams brought up.
    ///
    /// # Errors
    ///
    /// `Config` when no path is set or the file cannot be read.
    pub fn load_streams(&self) -> Result<usize> {
        let path = lock(&self.config_path)
            .clone()
            .ok_or_else(|| Aes67Error::Config {
                message: "no configuration path set".to_string(),
                source: None,
            })?;

        let file = StreamConfigFile::load(&path)?;
        let mut admitted = 0;
        for persisted in file.streams {
            if !persisted.enabled {
                continue;
            }
            let is_tx = persisted.sdp.direction == Direction::SendOnly;
            match self.admit(persisted.sdp, persisted.mapping, is_tx) {
                Ok(_) => admitted += 1,
                Err(e) => tracing::warn!("skipping saved stream: {e}"),
            }
        }
        Ok(admitted)
    }

    fn auto_save_if_enabled(&self) {
        if self.auto_save.load(Ordering::Acquire) {
            if let Err(e) = self.save_streams() {
                tracing::warn!("auto-save failed: {e}");
            }
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.remove_all();
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
