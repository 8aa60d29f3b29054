//! Cycle timing and application wake-up
//!
//! The [`CycleScheduler`] keeps track of when the next cycle starts on the
//! local clock. On a master it drives the transmission of SYNC frames, on a
//! client it detects SYNC frames that are late or missing.
//!
//! Applications wait for the cycle with a [`WaitKind`]. The embedding runtime
//! releases them with the [`CycleInfo`] that the TDMA instance reports for
//! every cycle.

use crate::time::{Duration, Time};

/// What a task waiting on the cycle wants to be woken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum WaitKind {
    /// Once per cycle, at the cycle start
    Default,
    /// At the start of every transmit slot the station owns
    Xmit,
}

/// Description of a released cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleInfo {
    pub cycle_no: u64,
    /// Start of the cycle on the local clock
    pub cycle_start: Time,
    /// Master minus local clock at the time of release
    pub clock_offset: Duration,
}

/// Result of a scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A master cycle starts
    Cycle { cycle_start: Time },
    /// A client did not see the SYNC of the cycle starting at
    /// `predicted_start` within the grace window
    Missed {
        predicted_start: Time,
        consecutive: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Master,
    Client,
}

/// Keeps the cycle clock of one TDMA instance
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    mode: Mode,
    period: Duration,
    grace_window: Duration,
    next_start: Option<Time>,
    drift: Duration,
    consecutive_misses: u32,
    missed_cycles: u64,
    deadline_misses: u64,
}

impl CycleScheduler {
    pub fn new(period: Duration, grace_window: Duration) -> Self {
        CycleScheduler {
            mode: Mode::Idle,
            period,
            grace_window,
            next_start: None,
            drift: Duration::ZERO,
            consecutive_misses: 0,
            missed_cycles: 0,
            deadline_misses: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Change the cycle period. The cycle that is already scheduled keeps its
    /// start time, the new period applies from there on.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn set_grace_window(&mut self, grace_window: Duration) {
        self.grace_window = grace_window;
    }

    /// Start producing master cycles, the first one starting at `first_start`
    pub fn start_master(&mut self, first_start: Time) {
        self.mode = Mode::Master;
        self.next_start = Some(first_start);
        self.drift = Duration::ZERO;
        self.consecutive_misses = 0;
    }

    /// Start following a master. No deadline is set until the first SYNC has
    /// been seen.
    pub fn start_client(&mut self) {
        self.mode = Mode::Client;
        self.next_start = None;
        self.drift = Duration::ZERO;
        self.consecutive_misses = 0;
    }

    /// Stop all cycle activity. Counters are kept.
    pub fn stop(&mut self) {
        self.mode = Mode::Idle;
        self.next_start = None;
        self.consecutive_misses = 0;
    }

    /// Reset all state, including the counters
    pub fn reset(&mut self) {
        self.stop();
        self.drift = Duration::ZERO;
        self.missed_cycles = 0;
        self.deadline_misses = 0;
    }

    pub fn is_running(&self) -> bool {
        self.mode != Mode::Idle
    }

    /// Predicted local start of the next cycle
    pub fn next_cycle_start(&self) -> Option<Time> {
        self.next_start
    }

    /// When [`tick`](Self::tick) should be called next
    pub fn deadline(&self) -> Option<Time> {
        let next_start = self.next_start?;
        match self.mode {
            Mode::Idle => None,
            Mode::Master => Some(next_start),
            Mode::Client => Some(next_start + self.grace_window),
        }
    }

    /// A SYNC was received announcing a cycle that started at `cycle_start`
    /// on the local clock. `drift` is the change of the clock offset per
    /// cycle, used to predict the start of cycles whose SYNC is missing.
    pub fn synchronize(&mut self, cycle_start: Time, drift: Duration) {
        if self.mode != Mode::Client {
            return;
        }

        self.next_start = Some(cycle_start + self.period - drift);
        self.drift = drift;
        self.consecutive_misses = 0;
    }

    /// Handle the scheduler deadline. Returns `None` when called before the
    /// deadline or while idle.
    pub fn tick(&mut self, now: Time) -> Option<Tick> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }

        let mut cycle_start = self.next_start?;

        // More than one period late: skipped cycles are not replayed
        let skipped = (now - deadline).div_periods(self.period);
        if skipped > 0 {
            log::error!(
                "Cycle deadline missed by {}, skipping {} cycles",
                now - deadline,
                skipped
            );
            self.deadline_misses += 1;
            cycle_start += self.step() * skipped;
        }

        self.next_start = Some(cycle_start + self.step());

        match self.mode {
            Mode::Idle => None,
            Mode::Master => {
                log::trace!("Cycle starts at {}", cycle_start);
                Some(Tick::Cycle { cycle_start })
            }
            Mode::Client => {
                self.missed_cycles += 1;
                self.consecutive_misses = self.consecutive_misses.saturating_add(1);
                log::debug!(
                    "No SYNC for cycle predicted at {} ({} in a row)",
                    cycle_start,
                    self.consecutive_misses
                );
                Some(Tick::Missed {
                    predicted_start: cycle_start,
                    consecutive: self.consecutive_misses,
                })
            }
        }
    }

    fn step(&self) -> Duration {
        self.period - self.drift
    }

    /// Total number of client cycles without SYNC
    pub fn missed_cycles(&self) -> u64 {
        self.missed_cycles
    }

    /// Number of ticks handled more than a full period late
    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }
}
