use arrayvec::ArrayVec;

use super::{admission::AdmissionPhase, event::RequestError};
use crate::{
    datastructures::common::{StationAddr, StationEntry, StationKind, StationTable, MAX_STATIONS},
    time::Duration,
};

/// A station committed to the station list of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Station {
    pub address: StationAddr,
    pub kind: StationKind,
    /// Offset of the transmit slot from the cycle start
    pub offset: Duration,
    pub phase: AdmissionPhase,
    /// Round trip measured with the TEST exchange during admission
    pub round_trip: Option<Duration>,
}

impl Station {
    pub(crate) fn entry(&self) -> StationEntry {
        StationEntry {
            address: self.address,
            kind: self.kind,
            offset_ns: wire_offset(self.offset),
        }
    }
}

/// Slot offsets are carried as 32 bit nanoseconds on the wire
pub(crate) fn wire_offset(offset: Duration) -> u32 {
    offset.whole_nanos().clamp(0, u32::MAX as i64) as u32
}

/// The committed stations of a master.
///
/// Only committed admissions change the real-time membership.
#[derive(Debug, Clone, Default)]
pub(crate) struct StationList {
    stations: ArrayVec<Station, MAX_STATIONS>,
}

impl StationList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.stations.is_full()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter()
    }

    pub(crate) fn get(&self, address: StationAddr) -> Option<&Station> {
        self.stations.iter().find(|s| s.address == address)
    }

    pub(crate) fn get_mut(&mut self, address: StationAddr) -> Option<&mut Station> {
        self.stations.iter_mut().find(|s| s.address == address)
    }

    pub(crate) fn commit(&mut self, station: Station) -> Result<(), RequestError> {
        if self.get(station.address).is_some() {
            return Err(RequestError::AlreadyMember);
        }
        self.stations
            .try_push(station)
            .map_err(|_| RequestError::StationListFull)
    }

    /// Remove a station of the given kind
    pub(crate) fn remove(&mut self, address: StationAddr, kind: StationKind) -> Option<Station> {
        let index = self
            .stations
            .iter()
            .position(|s| s.address == address && s.kind == kind)?;
        Some(self.stations.remove(index))
    }

    /// Whether an RT station other than `except` transmits at `offset`
    pub(crate) fn rt_slot_taken(&self, offset: Duration, except: Option<StationAddr>) -> bool {
        self.stations.iter().any(|s| {
            s.kind == StationKind::Rt && s.offset == offset && Some(s.address) != except
        })
    }

    /// Largest RT slot offset in use
    pub(crate) fn last_rt_offset(&self) -> Option<Duration> {
        self.stations
            .iter()
            .filter(|s| s.kind == StationKind::Rt)
            .map(|s| s.offset)
            .max()
    }

    /// Move all NRT stations to a new start of the non-real-time window
    pub(crate) fn set_nrt_offset(&mut self, offset: Duration) {
        for station in self.stations.iter_mut() {
            if station.kind == StationKind::Nrt {
                station.offset = offset;
            }
        }
    }

    /// The wire form of the list, with an optional candidate appended
    pub(crate) fn table(&self, candidate: Option<StationEntry>) -> StationTable {
        let mut table: StationTable = self.stations.iter().map(Station::entry).collect();
        if let Some(candidate) = candidate {
            if table.try_push(candidate).is_err() {
                log::error!("rtmac bug: no room for the candidate in the station table");
            }
        }
        table
    }

    pub(crate) fn clear(&mut self) {
        self.stations.clear();
    }
}
