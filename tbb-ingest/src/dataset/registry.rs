//! Channel registry: maps channel IDs to their write contexts.
//!
//! Station groups and channel arrays are created lazily the first time a
//! frame for them shows up. Both tables are capped so a flood of bogus
//! station IDs cannot grow an output without bound.

use std::collections::HashMap;

use thiserror::Error;

use crate::frame::{ChannelId, Header};
use crate::storage::{ArrayId, DEFAULT_CHUNK_SIZE, GroupId, Storage, StorageError};
use crate::trace::debug;

use super::metadata;

pub const DEFAULT_MAX_STATIONS: usize = 256;
pub const DEFAULT_MAX_CHANNELS: usize = 2048;

/// Reasons a channel could not be resolved.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("station table full ({capacity} stations)")]
    StationsFull { capacity: usize },

    #[error("channel table full ({capacity} channels)")]
    ChannelsFull { capacity: usize },

    #[error("creating storage for channel {channel} failed: {source}")]
    Storage {
        channel: ChannelId,
        #[source]
        source: StorageError,
    },
}

impl RegistryError {
    /// Whether the error came from a capacity cap.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::StationsFull { .. } | Self::ChannelsFull { .. })
    }
}

/// Write state for one channel.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub id: ChannelId,
    pub station: u8,
    pub array: ArrayId,
    /// Epoch second of the first accepted frame.
    pub origin_second: i32,
    /// Sample offset of the first accepted frame.
    pub origin_sample: u32,
    /// Current array length in samples. Never decreases.
    pub length: u64,
}

/// Storage grouping for one station.
#[derive(Debug, Clone)]
pub struct StationContext {
    pub id: u8,
    pub group: GroupId,
    pub channels: Vec<ChannelId>,
}

/// Lazily populated station and channel tables.
#[derive(Debug)]
pub struct Registry {
    stations: HashMap<u8, StationContext>,
    channels: HashMap<ChannelId, ChannelContext>,
    max_stations: usize,
    max_channels: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATIONS, DEFAULT_MAX_CHANNELS)
    }
}

impl Registry {
    #[must_use]
    pub fn new(max_stations: usize, max_channels: usize) -> Self {
        Self {
            stations: HashMap::new(),
            channels: HashMap::new(),
            max_stations,
            max_channels,
        }
    }

    /// Returns the context for `header`'s channel, creating the station group
    /// and channel array on first sight.
    ///
    /// A new channel's origin is taken from `header`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::StationsFull`] / [`RegistryError::ChannelsFull`] when a
    /// cap is reached, [`RegistryError::Storage`] if the backend refuses.
    pub fn resolve<S: Storage>(
        &mut self,
        storage: &mut S,
        header: &Header,
    ) -> Result<&mut ChannelContext, RegistryError> {
        let id = header.channel_id();
        if !self.channels.contains_key(&id) {
            let context = self.create_channel(storage, header)?;
            self.channels.insert(id, context);
        }
        self.channels
            .get_mut(&id)
            .ok_or(RegistryError::ChannelsFull {
                capacity: self.max_channels,
            })
    }

    fn create_channel<S: Storage>(
        &mut self,
        storage: &mut S,
        header: &Header,
    ) -> Result<ChannelContext, RegistryError> {
        let id = header.channel_id();
        if self.channels.len() >= self.max_channels {
            return Err(RegistryError::ChannelsFull {
                capacity: self.max_channels,
            });
        }
        let storage_err = |source| RegistryError::Storage {
            channel: id,
            source,
        };

        let group = self.resolve_station(storage, header.station, id)?;
        let array = storage
            .create_array(group, &metadata::channel_array_name(header), DEFAULT_CHUNK_SIZE)
            .map_err(storage_err)?;
        metadata::write_channel(storage, array, header).map_err(storage_err)?;

        if let Some(station) = self.stations.get_mut(&header.station) {
            station.channels.push(id);
        }
        debug!(channel = %id, second = header.epoch_second, sample = header.sample_offset, "new channel");

        Ok(ChannelContext {
            id,
            station: header.station,
            array,
            origin_second: header.epoch_second,
            origin_sample: header.sample_offset,
            length: 0,
        })
    }

    fn resolve_station<S: Storage>(
        &mut self,
        storage: &mut S,
        station: u8,
        channel: ChannelId,
    ) -> Result<GroupId, RegistryError> {
        if let Some(existing) = self.stations.get(&station) {
            return Ok(existing.group);
        }
        if self.stations.len() >= self.max_stations {
            return Err(RegistryError::StationsFull {
                capacity: self.max_stations,
            });
        }

        let storage_err = |source| RegistryError::Storage { channel, source };
        let group = storage
            .create_group(&metadata::station_group_name(station))
            .map_err(storage_err)?;
        metadata::write_station(storage, group).map_err(storage_err)?;
        debug!(station, "new station");

        self.stations.insert(
            station,
            StationContext {
                id: station,
                group,
                channels: Vec::new(),
            },
        );
        Ok(group)
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelContext> {
        self.channels.get(&id)
    }

    #[must_use]
    pub fn station(&self, id: u8) -> Option<&StationContext> {
        self.stations.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelContext> {
        self.channels.values()
    }

    #[must_use]
    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn header(station: u8, board: u8, receiver: u8) -> Header {
        Header {
            station,
            board,
            receiver,
            epoch_second: 100,
            sample_offset: 512,
            ..Header::default()
        }
    }

    #[test]
    fn first_sight_creates_group_and_array() {
        let mut storage = MemoryStorage::new();
        let mut registry = Registry::default();

        let ctx = registry.resolve(&mut storage, &header(2, 1, 7)).unwrap();
        assert_eq!(ctx.id.as_u32(), 2_001_007);
        assert_eq!((ctx.origin_second, ctx.origin_sample, ctx.length), (100, 512, 0));

        // Same channel resolves to the same context.
        let later = Header {
            epoch_second: 105,
            ..header(2, 1, 7)
        };
        let again = registry.resolve(&mut storage, &later).unwrap();
        assert_eq!(again.origin_second, 100);

        registry.resolve(&mut storage, &header(2, 1, 8)).unwrap();
        assert_eq!(registry.station_count(), 1);
        assert_eq!(registry.channel_count(), 2);
        assert_eq!(registry.station(2).unwrap().channels.len(), 2);

        let snap = storage.snapshot();
        assert_eq!(snap.groups.len(), 1);
        assert!(snap.array("Station002", "002001007").is_some());
        assert!(snap.array("Station002", "002001008").is_some());
    }

    #[test]
    fn channel_cap() {
        let mut storage = MemoryStorage::new();
        let mut registry = Registry::new(4, 2);

        registry.resolve(&mut storage, &header(1, 0, 0)).unwrap();
        registry.resolve(&mut storage, &header(1, 0, 1)).unwrap();
        let err = registry.resolve(&mut storage, &header(1, 0, 2)).unwrap_err();
        assert!(matches!(err, RegistryError::ChannelsFull { capacity: 2 }));
        assert!(err.is_full());

        // Known channels keep resolving.
        assert!(registry.resolve(&mut storage, &header(1, 0, 1)).is_ok());
    }

    #[test]
    fn station_cap() {
        let mut storage = MemoryStorage::new();
        let mut registry = Registry::new(1, 16);

        registry.resolve(&mut storage, &header(1, 0, 0)).unwrap();
        assert!(matches!(
            registry.resolve(&mut storage, &header(2, 0, 0)),
            Err(RegistryError::StationsFull { capacity: 1 })
        ));
        assert_eq!(storage.snapshot().groups.len(), 1);
    }
}
