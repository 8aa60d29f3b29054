//! Definitions and implementations of the abstract clock types

mod model;

pub use model::{CalibrationSample, ClockModel, SyncSample};

use crate::time::Time;

/// Clock manipulation and querying interface
///
/// The TDMA discipline never steers the clock it is given. It only reads it
/// and tracks the offset to the master in the [`ClockModel`]. A monotonic
/// clock is therefore the best fit: jumps in the local clock show up as
/// sudden offset changes.
pub trait Clock {
    /// Get the current time of the clock
    fn now(&self) -> Time;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Time {
        (**self).now()
    }
}
