//! Stream-to-device channel routing
//!
//! The single authority on which stream owns which of the 128 device
//! channels. Every admission goes through the router; the invariant it
//! defends is that no two streams ever claim the same channel. Control
//! path only: the router never touches audio data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Aes67Error, Result};
use crate::types::{StreamId, MAX_DEVICE_CHANNELS};

/// How one stream's channels map onto device channels
///
/// Without an explicit `channel_map` the mapping is sequential: stream
/// channel `i` lands on device channel `device_channel_start + i`. An
/// explicit map must carry exactly one in-range, duplicate-free entry
/// per stream channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    /// Owning stream
    #[serde(rename = "streamID")]
    pub stream_id: StreamId,
    /// Human-readable stream name
    #[serde(rename = "streamName")]
    pub stream_name: String,
    /// Channels carried by the stream
    #[serde(rename = "streamChannelCount")]
    pub stream_channel_count: u16,
    /// First stream channel to bridge
    #[serde(rename = "streamChannelOffset")]
    pub stream_channel_offset: u16,
    /// First device channel for sequential mapping
    #[serde(rename = "deviceChannelStart")]
    pub device_channel_start: u16,
    /// Device channels claimed (equals `stream_channel_count`)
    #[serde(rename = "deviceChannelCount")]
    pub device_channel_count: u16,
    /// Optional per-stream-channel routing into device channels
    #[serde(rename = "channelMap", default, skip_serializing_if = "Vec::is_empty")]
    pub channel_map: Vec<i32>,
}

impl ChannelMapping {
    /// Build a sequential mapping of `count` channels starting at `start`
    #[must_use]
    pub fn sequential(stream_id: StreamId, stream_name: &str, start: u16, count: u16) -> Self {
        Self {
            stream_id,
            stream_name: stream_name.to_string(),
            stream_channel_count: count,
            stream_channel_offset: 0,
            device_channel_start: start,
            device_channel_count: count,
            channel_map: Vec::new(),
        }
    }

    /// Validate the mapping shape
    ///
    /// # Errors
    ///
    /// `MappingInvalid` for structural defects, `MappingOutOfRange`
    /// when a claimed channel falls outside the device.
    pub fn validate(&self) -> Result<()> {
        if self.stream_id.is_null() {
            return Err(Aes67Error::MappingInvalid {
                message: "stream id is null".to_string(),
            });
        }
        if self.stream_channel_count == 0 {
            return Err(Aes67Error::MappingInvalid {
                message: "stream channel count is zero".to_string(),
            });
        }
        if self.device_channel_count != self.stream_channel_count {
            return Err(Aes67Error::MappingInvalid {
                message: format!(
                    "device channel count {} != stream channel count {}",
                    self.device_channel_count, self.stream_channel_count
                ),
            });
        }

        if self.channel_map.is_empty() {
            let end = usize::from(self.device_channel_start) + usize::from(self.device_channel_count);
            if end > MAX_DEVICE_CHANNELS {
                return Err(Aes67Error::MappingOutOfRange {
                    message: format!(
                        "sequential range [{}, {end}) exceeds {MAX_DEVICE_CHANNELS} channels",
                        self.device_channel_start
                    ),
                });
            }
            return Ok(());
        }

        if self.channel_map.len() != usize::from(self.stream_channel_count) {
            return Err(Aes67Error::MappingInvalid {
                message: format!(
                    "channel map has {} entries for {} stream channels",
                    self.channel_map.len(),
                    self.stream_channel_count
                ),
            });
        }

        let mut seen = [false; MAX_DEVICE_CHANNELS];
        for &entry in &self.channel_map {
            let Ok(channel) = usize::try_from(entry) else {
                return Err(Aes67Error::MappingOutOfRange {
                    message: format!("negative device channel {entry}"),
                });
            };
            if channel >= MAX_DEVICE_CHANNELS {
                return Err(Aes67Error::MappingOutOfRange {
                    message: format!("device channel {channel} out of range"),
                });
            }
            if seen[channel] {
                return Err(Aes67Error::MappingInvalid {
                    message: format!("duplicate device channel {channel} in map"),
                });
            }
            seen[channel] = true;
        }

        Ok(())
    }

    /// Device channel for stream channel `index`, if mapped
    #[must_use]
    pub fn device_channel(&self, index: u16) -> Option<u16> {
        if index >= self.stream_channel_count {
            return None;
        }
        if self.channel_map.is_empty() {
            Some(self.device_channel_start + index)
        } else {
            u16::try_from(self.channel_map[usize::from(index)]).ok()
        }
    }

    /// Iterate the device channels this mapping claims
    pub fn device_channels(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.stream_channel_count).filter_map(|i| self.device_channel(i))
    }

    /// Whether `channel` is claimed by this mapping
    #[must_use]
    pub fn contains_device_channel(&self, channel: u16) -> bool {
        self.device_channels().any(|c| c == channel)
    }
}

struct RouterState {
    /// Slot k holds the owner of device channel k, null when free
    owners: [StreamId; MAX_DEVICE_CHANNELS],
    by_id: BTreeMap<StreamId, ChannelMapping>,
}

/// The 128-slot channel ownership map
pub struct ChannelRouter {
    state: std::sync::Mutex<RouterState>,
}

impl ChannelRouter {
    /// Create a router with every channel free
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(RouterState {
                owners: [StreamId::null(); MAX_DEVICE_CHANNELS],
                by_id: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a new mapping, refusing any overlap
    ///
    /// # Errors
    ///
    /// Validation errors from the mapping itself, `StreamAlreadyExists`
    /// for a duplicate id, or `ChannelOverlap` naming the first
    /// contested channel. On error the router state is unchanged.
    pub fn add(&self, mapping: ChannelMapping) -> Result<()> {
        mapping.validate()?;

        let mut state = self.lock();
        if state.by_id.contains_key(&mapping.stream_id) {
            return Err(Aes67Error::StreamAlreadyExists {
                id: mapping.stream_id,
            });
        }

        for channel in mapping.device_channels() {
            let owner = state.owners[usize::from(channel)];
            if !owner.is_null() {
                return Err(Aes67Error::ChannelOverlap { channel, owner });
            }
        }

        for channel in mapping.device_channels() {
            state.owners[usize::from(channel)] = mapping.stream_id;
        }
        state.by_id.insert(mapping.stream_id, mapping);
        Ok(())
    }

    /// Remove a stream's mapping, freeing its channels
    ///
    /// # Errors
    ///
    /// `StreamNotFound` when the id has no mapping.
    pub fn remove(&self, id: StreamId) -> Result<()> {
        let mut state = self.lock();
        if state.by_id.remove(&id).is_none() {
            return Err(Aes67Error::StreamNotFound { id });
        }
        for owner in &mut state.owners {
            if *owner == id {
                *owner = StreamId::null();
            }
        }
        Ok(())
    }

    /// Replace a stream's mapping
    ///
    /// Like [`add`](Self::add) but channels already owned by the same
    /// stream do not count as overlap.
    ///
    /// # Errors
    ///
    /// Validation errors, `StreamNotFound` for an unknown id, or
    /// `ChannelOverlap`. On error the previous mapping stays in place.
    pub fn update(&self, mapping: ChannelMapping) -> Result<()> {
        mapping.validate()?;

        let mut state = self.lock();
        if !state.by_id.contains_key(&mapping.stream_id) {
            return Err(Aes67Error::StreamNotFound {
                id: mapping.stream_id,
            });
        }

        for channel in mapping.device_channels() {
            let owner = state.owners[usize::from(channel)];
            if !owner.is_null() && owner != mapping.stream_id {
                return Err(Aes67Error::ChannelOverlap { channel, owner });
            }
        }

        let id = mapping.stream_id;
        for owner in &mut state.owners {
            if *owner == id {
                *owner = StreamId::null();
            }
        }
        for channel in mapping.device_channels() {
            state.owners[usize::from(channel)] = id;
        }
        state.by_id.insert(id, mapping);
        Ok(())
    }

    /// The mapping for `id`, if present
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<ChannelMapping> {
        self.lock().by_id.get(&id).cloned()
    }

    /// All mappings, ordered by stream id
    #[must_use]
    pub fn all(&self) -> Vec<ChannelMapping> {
        self.lock().by_id.values().cloned().collect()
    }

    /// Drop every mapping and free all channels
    pub fn clear(&self) {
        let mut state = self.lock();
        state.by_id.clear();
        state.owners = [StreamId::null(); MAX_DEVICE_CHANNELS];
    }

    /// First contiguous run of at least `count` free channels
    ///
    /// Scans from channel 0; the smallest start wins.
    #[must_use]
    pub fn find_free_block(&self, count: u16) -> Option<u16> {
        if count == 0 || usize::from(count) > MAX_DEVICE_CHANNELS {
            return None;
        }

        let state = self.lock();
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for (index, owner) in state.owners.iter().enumerate() {
            if owner.is_null() {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len >= usize::from(count) {
                    return u16::try_from(run_start).ok();
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Build a sequential mapping in the first free block
    ///
    /// # Errors
    ///
    /// `NoChannelsAvailable` when no contiguous block of `count`
    /// channels exists.
    pub fn default_mapping(
        &self,
        id: StreamId,
        name: &str,
        count: u16,
    ) -> Result<ChannelMapping> {
        let start = self
            .find_free_block(count)
            .ok_or(Aes67Error::NoChannelsAvailable { requested: count })?;
        Ok(ChannelMapping::sequential(id, name, start, count))
    }

    /// Owner of a device channel, `None` when free or out of range
    #[must_use]
    pub fn owner_of(&self, channel: u16) -> Option<StreamId> {
        let state = self.lock();
        state
            .owners
            .get(usize::from(channel))
            .filter(|owner| !owner.is_null())
            .copied()
    }

    /// Whether a mapping would collide with other streams' channels
    #[must_use]
    pub fn has_overlap(&self, mapping: &ChannelMapping) -> bool {
        let state = self.lock();
        mapping.device_channels().any(|channel| {
            let owner = state.owners[usize::from(channel)];
            !owner.is_null() && owner != mapping.stream_id
        })
    }

    /// Streams whose channels a mapping would collide with
    #[must_use]
    pub fn overlapping_streams(&self, mapping: &ChannelMapping) -> Vec<StreamId> {
        let state = self.lock();
        let mut ids = Vec::new();
        for channel in mapping.device_channels() {
            let owner = state.owners[usize::from(channel)];
            if !owner.is_null() && owner != mapping.stream_id && !ids.contains(&owner) {
                ids.push(owner);
            }
        }
        ids
    }

    /// Unassigned device channels
    #[must_use]
    pub fn unassigned_channels(&self) -> Vec<u16> {
        let state = self.lock();
        state
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.is_null())
            .filter_map(|(index, _)| u16::try_from(index).ok())
            .collect()
    }

    /// Count of free device channels
    #[must_use]
    pub fn free_channels(&self) -> usize {
        let state = self.lock();
        state.owners.iter().filter(|owner| owner.is_null()).count()
    }

    /// Count of owned device channels
    #[must_use]
    pub fn used_count(&self) -> usize {
        MAX_DEVICE_CHANNELS - self.free_channels()
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}
