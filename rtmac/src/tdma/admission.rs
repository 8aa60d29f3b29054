//! Bookkeeping for the admission of a single candidate station
//!
//! The master runs at most one handshake at a time. The candidate only lives
//! here until the handshake completes; the committed station list is not
//! touched before that.

use core::fmt::{Display, Formatter};

use crate::{
    datastructures::common::{StationAddr, StationEntry},
    time::Duration,
};

/// Progress of the admission of one station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AdmissionPhase {
    /// Not negotiating, for instance while waiting for a retry
    Down,
    SentConf,
    RcvdConf,
    SentTest,
    RcvdTest,
    CompTest,
    /// Committed to the station list
    Client,
}

impl Display for AdmissionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            AdmissionPhase::Down => write!(f, "Down"),
            AdmissionPhase::SentConf => write!(f, "SentConf"),
            AdmissionPhase::RcvdConf => write!(f, "RcvdConf"),
            AdmissionPhase::SentTest => write!(f, "SentTest"),
            AdmissionPhase::RcvdTest => write!(f, "RcvdTest"),
            AdmissionPhase::CompTest => write!(f, "CompTest"),
            AdmissionPhase::Client => write!(f, "Client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAdmission {
    pub(crate) entry: StationEntry,
    pub(crate) phase: AdmissionPhase,
    /// Number of the handshake currently running or scheduled, starting at 1
    pub(crate) attempt: u8,
    pub(crate) test_counter: u32,
    pub(crate) test_xmit_stamp: u64,
}

impl PendingAdmission {
    pub(crate) fn new(entry: StationEntry) -> Self {
        PendingAdmission {
            entry,
            phase: AdmissionPhase::Down,
            attempt: 1,
            test_counter: 0,
            test_xmit_stamp: 0,
        }
    }

    pub(crate) fn address(&self) -> StationAddr {
        self.entry.address
    }

    pub(crate) fn is_negotiating(&self) -> bool {
        self.phase != AdmissionPhase::Down
    }

    pub(crate) fn set_phase(&mut self, phase: AdmissionPhase) {
        log::debug!(
            "Admission of {}: {} -> {}",
            self.entry.address,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    /// Whether an `ACK_CONF` echoes what was offered in the CONF
    pub(crate) fn accepts(&self, cycle_period_ns: u64, offered_period: Duration, offset_ns: u32) -> bool {
        i128::from(cycle_period_ns) == i128::from(offered_period.whole_nanos())
            && offset_ns == self.entry.offset_ns
    }

    /// Round trip of the TEST exchange, from the stamps carried in ACK_TEST
    /// and the local reception time `t4`
    pub(crate) fn round_trip(
        &self,
        request_xmit_stamp: u64,
        reception_stamp: u64,
        xmit_stamp: u64,
        t4: u64,
    ) -> Duration {
        let local = t4 as i128 - request_xmit_stamp as i128;
        let remote = xmit_stamp as i128 - reception_stamp as i128;
        Duration::from_fixed_nanos(local - remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastructures::common::StationKind;

    fn pending() -> PendingAdmission {
        PendingAdmission::new(StationEntry {
            address: StationAddr([2, 0, 0, 0, 0, 9]),
            kind: StationKind::Rt,
            offset_ns: 200_000,
        })
    }

    #[test]
    fn ack_conf_must_echo_offer() {
        let pending = pending();
        let period = Duration::from_millis(1);

        assert!(pending.accepts(1_000_000, period, 200_000));
        assert!(!pending.accepts(2_000_000, period, 200_000));
        assert!(!pending.accepts(1_000_000, period, 100_000));
    }

    #[test]
    fn round_trip_excludes_remote_processing() {
        let pending = pending();
        // 30us out, 50us remote processing, 40us back
        let rtt = pending.round_trip(1_000, 9_000_030, 9_000_080, 1_120);
        assert_eq!(rtt, Duration::from_nanos(70));
    }
}
