use crate::time::{Duration, Time};

/// The four timestamps of one calibration exchange.
///
/// `t1` and `t4` are taken on the local clock (request sent, reply
/// received), `t2` and `t3` on the master clock (request received, reply
/// sent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSample {
    pub t1: Time,
    pub t2: Time,
    pub t3: Time,
    pub t4: Time,
}

impl CalibrationSample {
    /// Time spent on the wire in both directions together
    pub fn round_trip(&self) -> Duration {
        (self.t4 - self.t1) - (self.t3 - self.t2)
    }

    /// Master minus local clock, assuming a symmetric path
    pub fn offset(&self) -> Duration {
        ((self.t2 - self.t1) - (self.t4 - self.t3)) / 2
    }
}

/// Timestamps observed for one received SYNC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    /// Extended (non-wrapping) cycle number of the frame
    pub cycle_no: u64,
    /// When the master actually transmitted the frame, master clock
    pub xmit_stamp: Time,
    /// When the master intended to transmit the frame, master clock. This is
    /// the start of the cycle.
    pub sched_xmit_stamp: Time,
    /// When the frame was received, local clock
    pub receive_time: Time,
}

#[derive(Debug, Clone, Copy, Default)]
struct Calibration {
    target_rounds: u16,
    completed_rounds: u16,
    delay_sum: Duration,
    outstanding: Option<u64>,
}

/// Tracks the relation between the local clock and the cycle clock of the
/// master.
///
/// The offset is positive when the master clock is ahead of the local clock.
/// It is estimated from calibration exchanges while joining and re-estimated
/// from every SYNC frame afterwards, using the mean one-way packet delay
/// measured during calibration.
#[derive(Debug, Clone)]
pub struct ClockModel {
    offset: Duration,
    packet_delay: Duration,
    drift: Duration,
    calibration: Calibration,
    last_sync: Option<SyncSample>,
}

impl ClockModel {
    pub fn new(calibration_rounds: u16) -> Self {
        ClockModel {
            offset: Duration::ZERO,
            packet_delay: Duration::ZERO,
            drift: Duration::ZERO,
            calibration: Calibration {
                target_rounds: calibration_rounds,
                ..Default::default()
            },
            last_sync: None,
        }
    }

    /// Forget everything learned about the master
    pub fn reset(&mut self) {
        *self = Self::new(self.calibration.target_rounds);
    }

    /// Current master minus local correction
    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Mean one-way delay measured during calibration
    pub fn packet_delay(&self) -> Duration {
        self.packet_delay
    }

    /// Change of the offset per cycle, as seen over the last two SYNC frames
    pub fn drift(&self) -> Duration {
        self.drift
    }

    pub fn last_sync(&self) -> Option<&SyncSample> {
        self.last_sync.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.completed_rounds >= self.calibration.target_rounds
    }

    pub fn calibration_rounds(&self) -> (u16, u16) {
        (
            self.calibration.completed_rounds,
            self.calibration.target_rounds,
        )
    }

    /// Whether a new calibration request should go out now
    pub fn wants_calibration_request(&self) -> bool {
        !self.is_calibrated() && self.calibration.outstanding.is_none()
    }

    /// Register that a calibration request with transmit stamp `t1` was sent.
    /// A previously outstanding request is abandoned.
    pub fn calibration_requested(&mut self, t1: u64) {
        self.calibration.outstanding = Some(t1);
    }

    /// Abandon an outstanding request, for instance because its reply never
    /// arrived within a cycle.
    pub fn calibration_lost(&mut self) {
        if self.calibration.outstanding.take().is_some() {
            log::debug!("Calibration reply lost, will retry");
        }
    }

    /// Absorb the reply to a calibration request. Returns the offset estimate
    /// of this exchange when it was accepted.
    pub fn absorb_calibration(&mut self, sample: CalibrationSample) -> Option<Duration> {
        match self.calibration.outstanding {
            Some(t1) if t1 == sample.t1.wire_nanos() => {}
            Some(_) => {
                log::warn!("Calibration reply does not match outstanding request");
                return None;
            }
            None => {
                log::debug!("Unexpected calibration reply ignored");
                return None;
            }
        }
        self.calibration.outstanding = None;

        let round_trip = sample.round_trip();
        if round_trip.is_negative() {
            log::warn!("Calibration round trip is negative ({round_trip}), ignoring");
            return None;
        }

        let calibration = &mut self.calibration;
        calibration.completed_rounds = calibration.completed_rounds.saturating_add(1);
        calibration.delay_sum += round_trip / 2;
        self.packet_delay = calibration.delay_sum / calibration.completed_rounds;

        let estimate = sample.offset();
        self.offset = estimate;

        log::debug!(
            "Calibration round {}/{}: round trip {}, offset {}",
            calibration.completed_rounds,
            calibration.target_rounds,
            round_trip,
            estimate
        );

        Some(estimate)
    }

    /// Absorb a SYNC frame, re-estimating the offset. Returns the start of the
    /// announced cycle on the local clock.
    pub fn absorb_sync(&mut self, sample: SyncSample) -> Time {
        let offset = (sample.xmit_stamp - sample.receive_time) + self.packet_delay;

        if let Some(previous) = self.last_sync {
            let cycles = sample.cycle_no.saturating_sub(previous.cycle_no);
            if cycles > 0 {
                self.drift = (offset - self.offset) / cycles;
            }
        }

        self.offset = offset;
        self.last_sync = Some(sample);

        self.to_local(sample.sched_xmit_stamp)
    }

    /// Convert a timestamp of the master clock to the local clock
    pub fn to_local(&self, master_time: Time) -> Time {
        master_time - self.offset
    }

    /// Convert a timestamp of the local clock to the master clock
    pub fn to_master(&self, local_time: Time) -> Time {
        local_time + self.offset
    }

    /// Offset expected `cycles` cycles after the last SYNC, extrapolating the
    /// drift
    pub fn predicted_offset(&self, cycles: u64) -> Duration {
        self.offset + self.drift * cycles
    }
}
