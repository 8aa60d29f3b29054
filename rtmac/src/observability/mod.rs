//! Serializable snapshots of a TDMA instance to be used for observability
//!
//! A [`TdmaSnapshot`] is a copy of everything an operator wants to know about
//! an instance. Taking one never changes the instance.

use arrayvec::ArrayVec;

use crate::{
    datastructures::common::{StationAddr, StationKind, MAX_STATIONS},
    tdma::{AdmissionPhase, Role, TdmaState},
};
#[cfg(doc)]
use crate::tdma::TdmaInstance;

/// Event counters of a [`TdmaInstance`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TdmaCounters {
    /// Received frames that could not be parsed
    pub malformed_frames: u64,
    /// Frames and timer expiries that did not apply in the state they
    /// arrived in
    pub discarded_events: u64,
    /// Cycles a client released without having seen their SYNC
    pub missed_cycles: u64,
    /// Cycle ticks handled more than a full period late
    pub deadline_misses: u64,
    /// Admission handshakes that timed out
    pub admission_failures: u64,
}

/// A station in the station list of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationSnapshot {
    pub address: StationAddr,
    pub kind: StationKind,
    pub offset_ns: i64,
    pub phase: AdmissionPhase,
    pub round_trip_ns: Option<i64>,
}

/// The admission a master is currently running or retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingSnapshot {
    pub address: StationAddr,
    pub kind: StationKind,
    pub offset_ns: u32,
    pub phase: AdmissionPhase,
    pub attempt: u8,
}

/// A read-only view on a [`TdmaInstance`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TdmaSnapshot {
    pub station_address: StationAddr,
    pub role: Role,
    pub state: TdmaState,
    /// Number of the next cycle
    pub cycle_no: u64,
    /// Master minus local clock
    pub clock_offset_ns: i64,
    pub packet_delay_ns: i64,
    pub cycle_period_ns: i64,
    pub mtu: u16,
    /// Whether a client finished its calibration exchanges
    pub calibrated: bool,
    /// The master a client follows or is joining
    pub master: Option<StationAddr>,
    pub own_offset_ns: Option<i64>,
    pub pending: Option<PendingSnapshot>,
    pub stations: ArrayVec<StationSnapshot, MAX_STATIONS>,
    pub counters: TdmaCounters,
}
