//! Implementation of the abstract clock for the linux platform

use rtmac::{
    time::{Duration, Time},
    Clock,
};

/// The monotonic clock of the system
///
/// TDMA never steers the local clock, it only tracks the offset to the
/// master. A clock that is not affected by NTP or manual adjustments keeps
/// that offset smooth.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxClock;

impl LinuxClock {
    pub fn new() -> Self {
        LinuxClock
    }

    /// Translate a point in time on this clock to the corresponding tokio
    /// instant
    pub fn instant_of(&self, time: Time) -> tokio::time::Instant {
        let now = tokio::time::Instant::now();
        let until = time - self.now();
        if until.is_negative() {
            now
        } else {
            now + core::time::Duration::from(until)
        }
    }
}

impl Clock for LinuxClock {
    fn now(&self) -> Time {
        let mut spec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // CLOCK_MONOTONIC is always available, so this cannot fail
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut spec) };

        timespec_into_time(spec)
    }
}

pub fn timespec_into_time(spec: libc::timespec) -> Time {
    Time::from_secs(spec.tv_sec as u64) + Duration::from_nanos(spec.tv_nsec as i64)
}
