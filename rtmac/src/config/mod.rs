//! Configuration of a TDMA instance

use arrayvec::ArrayVec;

pub use crate::datastructures::common::{StationAddr, StationKind, MAX_STATIONS};
use crate::time::Duration;
#[cfg(doc)]
use crate::tdma::TdmaInstance;

/// Maximum number of transmit slots a master can own in one cycle
pub const MAX_MASTER_SLOTS: usize = 8;

/// Smallest non-real-time payload limit accepted by `CHANGE_MTU`
pub const MIN_MTU: u16 = 64;
/// Largest non-real-time payload limit accepted by `CHANGE_MTU`
pub const MAX_MTU: u16 = 1500;

/// Configuration of a [`TdmaInstance`]
///
/// Use [`TdmaConfig::new`] to get a configuration with the usual defaults and
/// adjust the fields that matter for the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdmaConfig {
    /// Address of the interface the instance is attached to
    pub station_address: StationAddr,

    /// Cycle period used when becoming master without an explicit period
    pub cycle_period: Duration,

    /// Number of cycles a new master listens for a competing master before
    /// it starts admitting stations
    pub master_wait_cycles: u32,

    /// How long the master waits for `ACK_CONF` and `ACK_TEST`, and how long
    /// a client waits for `TEST` or `ACK_ACK_CONF`
    pub admission_timeout: Duration,

    /// Number of handshakes attempted for one candidate before it is dropped
    pub max_admission_attempts: u8,

    /// Delay before the first retry of a failed admission. Each further retry
    /// doubles it, up to 8 times this value.
    pub retry_backoff: Duration,

    /// Number of calibration exchanges a client performs after joining
    pub calibration_rounds: u16,

    /// Consecutive cycles without SYNC after which a client leaves the
    /// cycle
    pub max_missed_cycles: u32,

    /// Time after the predicted cycle start that a client waits for the SYNC
    /// before counting the cycle as missed. Defaults to a quarter of the
    /// cycle period.
    pub grace_window: Option<Duration>,

    /// Maximum non-real-time payload per cycle in bytes
    pub mtu: u16,

    /// Start of the non-real-time window relative to the cycle start.
    /// Defaults to three quarters of the cycle period.
    pub nrt_offset: Option<Duration>,

    /// Offsets of the transmit slots of the master itself
    pub master_slots: ArrayVec<Duration, MAX_MASTER_SLOTS>,
}

impl TdmaConfig {
    pub fn new(station_address: StationAddr) -> Self {
        let mut master_slots = ArrayVec::new();
        master_slots.push(Duration::ZERO);

        TdmaConfig {
            station_address,
            cycle_period: Duration::from_millis(5),
            master_wait_cycles: 3,
            admission_timeout: Duration::from_millis(100),
            max_admission_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            calibration_rounds: 100,
            max_missed_cycles: 8,
            grace_window: None,
            mtu: MAX_MTU,
            nrt_offset: None,
            master_slots,
        }
    }

    /// The grace window to use for a cycle of length `period`
    pub fn grace_window_for(&self, period: Duration) -> Duration {
        self.grace_window.unwrap_or(period / 4)
    }

    /// The start of the non-real-time window for a cycle of length `period`
    pub fn nrt_offset_for(&self, period: Duration) -> Duration {
        self.nrt_offset.unwrap_or(period * 3 / 4)
    }

    /// Delay before retry number `attempt` (starting at 1) of a failed
    /// admission
    pub fn retry_delay(&self, attempt: u8) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(3);
        self.retry_backoff * factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_defaults() {
        let config = TdmaConfig::new(StationAddr([2, 0, 0, 0, 0, 1]));
        let period = Duration::from_millis(1);

        assert_eq!(config.grace_window_for(period), Duration::from_micros(250));
        assert_eq!(config.nrt_offset_for(period), Duration::from_micros(750));
        assert_eq!(config.master_slots.as_slice(), &[Duration::ZERO]);
    }

    #[test]
    fn retry_backoff_is_capped() {
        let config = TdmaConfig {
            retry_backoff: Duration::from_millis(10),
            ..TdmaConfig::new(StationAddr::default())
        };

        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(40));
        assert_eq!(config.retry_delay(4), Duration::from_millis(80));
        assert_eq!(config.retry_delay(9), Duration::from_millis(80));
    }
}
