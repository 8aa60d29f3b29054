use crate::datastructures::{
    common::{CycleParameters, StationAddr, StationEntry, StationTable, MAX_STATIONS},
    WireFormat, WireFormatError,
};

/// Cycle parameters together with the station list.
///
/// Sent by the master as CONF to a joining station, listing the committed
/// stations plus the candidate, and broadcast as STATION_LIST whenever the
/// committed list or the cycle parameters change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StationListFrame {
    pub(crate) params: CycleParameters,
    pub(crate) stations: StationTable,
}

pub(crate) type ConfFrame = StationListFrame;

impl StationListFrame {
    pub(crate) fn content_size(&self) -> usize {
        16 + 12 * self.stations.len()
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        if buffer.len() < self.content_size() {
            return Err(WireFormatError::BufferTooShort);
        }

        self.params.serialize(&mut buffer[0..14])?;
        buffer[14..16].copy_from_slice(&(self.stations.len() as u16).to_be_bytes());
        for (entry, chunk) in self.stations.iter().zip(buffer[16..].chunks_mut(12)) {
            entry.serialize(chunk)?;
        }

        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let params = CycleParameters::deserialize(buffer)?;

        let count = match buffer.get(14..16) {
            Some(buf) => u16::from_be_bytes([buf[0], buf[1]]) as usize,
            None => return Err(WireFormatError::BufferTooShort),
        };
        if count > MAX_STATIONS {
            return Err(WireFormatError::TooManyStations);
        }

        let entries = buffer
            .get(16..16 + 12 * count)
            .ok_or(WireFormatError::BufferTooShort)?;

        let mut stations = StationTable::new();
        for chunk in entries.chunks_exact(12) {
            stations.push(StationEntry::deserialize(chunk)?);
        }

        Ok(Self { params, stations })
    }

    /// The entry describing `address`, if listed
    pub(crate) fn entry(&self, address: StationAddr) -> Option<&StationEntry> {
        self.stations.iter().find(|entry| entry.address == address)
    }
}
