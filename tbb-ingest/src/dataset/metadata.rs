//! Default attributes written to every output, station group and channel array.

use crate::frame::Header;
use crate::storage::{ArrayId, AttrValue, GroupId, Node, Storage, StorageError};

const UNDEFINED: &str = "UNDEFINED";

/// Observation-level attributes attached to the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMetadata {
    pub telescope: String,
    pub observer: String,
    pub project_title: String,
    pub observation_id: String,
    pub filter_selection: String,
    pub antenna_set: String,
}

impl Default for OutputMetadata {
    fn default() -> Self {
        Self {
            telescope: "LOFAR".to_owned(),
            observer: UNDEFINED.to_owned(),
            project_title: UNDEFINED.to_owned(),
            observation_id: UNDEFINED.to_owned(),
            filter_selection: UNDEFINED.to_owned(),
            antenna_set: UNDEFINED.to_owned(),
        }
    }
}

/// Group name for a station: `Station007`.
#[must_use]
pub fn station_group_name(station: u8) -> String {
    format!("Station{station:03}")
}

/// Array name for a channel: `007003021`.
#[must_use]
pub fn channel_array_name(header: &Header) -> String {
    format!(
        "{:03}{:03}{:03}",
        header.station, header.board, header.receiver
    )
}

pub(crate) fn write_root<S: Storage>(
    storage: &mut S,
    filename: &str,
    meta: &OutputMetadata,
) -> Result<(), StorageError> {
    let attrs = [
        ("FILENAME", filename),
        ("TELESCOPE", meta.telescope.as_str()),
        ("OBSERVER", meta.observer.as_str()),
        ("PROJECT_TITLE", meta.project_title.as_str()),
        ("OBSERVATION_ID", meta.observation_id.as_str()),
        ("FILTER_SELECTION", meta.filter_selection.as_str()),
        ("ANTENNA_SET", meta.antenna_set.as_str()),
    ];
    for (name, value) in attrs {
        storage.set_attribute(Node::Root, name, value.into())?;
    }
    Ok(())
}

pub(crate) fn write_station<S: Storage>(storage: &mut S, group: GroupId) -> Result<(), StorageError> {
    let node = Node::Group(group);
    let attrs: [(&str, AttrValue); 10] = [
        ("STATION_POSITION_VALUE", AttrValue::FloatVec(vec![0.0; 3])),
        ("STATION_POSITION_UNIT", vec!["m"; 3].into()),
        ("STATION_POSITION_FRAME", vec!["ITRF"].into()),
        ("BEAM_DIRECTION_VALUE", AttrValue::FloatVec(vec![0.0, 90.0])),
        ("BEAM_DIRECTION_UNIT", vec!["deg"; 2].into()),
        ("BEAM_DIRECTION_FRAME", vec!["AZEL"].into()),
        ("TRIGGER_TYPE", vec![UNDEFINED].into()),
        ("TRIGGER_OFFSET", AttrValue::FloatVec(vec![0.0])),
        ("TRIGGERED_ANTENNAS", AttrValue::IntVec(vec![0])),
        ("OBSERVATION_MODE", vec!["Transient"].into()),
    ];
    for (name, value) in attrs {
        storage.set_attribute(node, name, value)?;
    }
    Ok(())
}

/// Channel attributes; `header` is the first frame accepted for the channel.
pub(crate) fn write_channel<S: Storage>(
    storage: &mut S,
    array: ArrayId,
    header: &Header,
) -> Result<(), StorageError> {
    let node = Node::Array(array);
    let attrs: [(&str, AttrValue); 16] = [
        ("STATION_ID", AttrValue::UInt(header.station.into())),
        ("RSP_ID", AttrValue::UInt(header.board.into())),
        ("RCU_ID", AttrValue::UInt(header.receiver.into())),
        ("TIME", AttrValue::Int(header.epoch_second.into())),
        ("SAMPLE_NUMBER", AttrValue::UInt(header.sample_offset.into())),
        ("SAMPLES_PER_FRAME", AttrValue::UInt(header.samples_per_frame.into())),
        ("ANTENNA_POSITION_VALUE", AttrValue::FloatVec(vec![0.0; 3])),
        ("ANTENNA_POSITION_UNIT", vec!["m"; 3].into()),
        ("ANTENNA_POSITION_FRAME", vec!["ITRF"].into()),
        ("ANTENNA_ORIENTATION_VALUE", AttrValue::FloatVec(vec![0.0; 3])),
        ("ANTENNA_ORIENTATION_UNIT", vec!["m"; 3].into()),
        ("ANTENNA_ORIENTATION_FRAME", vec!["ITRF"].into()),
        ("FEED", vec![UNDEFINED].into()),
        ("NYQUIST_ZONE", AttrValue::UInt(1)),
        ("SAMPLE_FREQUENCY_VALUE", AttrValue::Float(header.sample_freq_mhz.into())),
        ("SAMPLE_FREQUENCY_UNIT", vec!["MHz"].into()),
    ];
    for (name, value) in attrs {
        storage.set_attribute(node, name, value)?;
    }
    Ok(())
}
