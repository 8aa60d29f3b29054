//! Common data structures that are used throughout the TDMA frames

mod cycle;
mod station;

use arrayvec::ArrayVec;
pub use cycle::CycleParameters;
pub use station::{AddrParseError, StationAddr, StationEntry, StationKind};

/// Maximum number of stations in one TDMA domain, including the master
pub const MAX_STATIONS: usize = 32;

/// The station list as exchanged between master and clients
pub type StationTable = ArrayVec<StationEntry, MAX_STATIONS>;
