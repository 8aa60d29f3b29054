use core::iter::Fuse;

use arrayvec::ArrayVec;

use crate::{datastructures::common::StationAddr, scheduler::CycleInfo};

/// Where a frame should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Station(StationAddr),
}

impl Destination {
    pub fn address(&self) -> StationAddr {
        match self {
            Destination::Broadcast => StationAddr::BROADCAST,
            Destination::Station(addr) => *addr,
        }
    }
}

/// The expected event a timer is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TimerKind {
    /// Retry of a failed admission
    AddRt,
    MasterWait,
    MasterSentConf,
    MasterSentTest,
    ClientSentAck,
}

/// Identification of one arming of the instance timer.
///
/// The runtime hands it back to
/// [`TdmaInstance::handle_timer`](`super::TdmaInstance::handle_timer`) when the
/// timer expires. Expiries of an arming that has since been replaced or
/// canceled are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub(super) generation: u32,
}

/// An action the [`TdmaInstance`](`super::TdmaInstance`) needs the user to
/// perform
#[derive(Debug)]
#[must_use]
#[allow(missing_docs)] // Explaining the fields as well as the variants does not add value
pub enum TdmaAction<'a> {
    /// Send a frame under the RTmac ethertype
    SendFrame {
        destination: Destination,
        data: &'a [u8],
    },
    /// Arm the instance timer, replacing any previous arming. Call
    /// [`TdmaInstance::handle_timer`](`super::TdmaInstance::handle_timer`)
    /// with `timer` in `duration` from now.
    ResetTimer {
        timer: TimerId,
        duration: core::time::Duration,
    },
    /// Disarm the instance timer
    CancelTimer,
    /// A cycle started. Release tasks waiting for the cycle and schedule the
    /// release of tasks waiting for the transmit slots of this cycle.
    ReleaseCycle { info: CycleInfo },
}

pub(super) const MAX_ACTIONS: usize = 3;

/// An Iterator over [`TdmaAction`]s
///
/// These are returned by [`TdmaInstance`](`super::TdmaInstance`) whenever the
/// library needs the user to perform actions to the system.
///
/// **Guarantees to end user:** Any set of actions will only ever contain a
/// single frame to send and a single timer change
#[derive(Debug)]
#[must_use]
pub struct TdmaActionIterator<'a> {
    internal: Fuse<<ArrayVec<TdmaAction<'a>, MAX_ACTIONS> as IntoIterator>::IntoIter>,
}

impl<'a> TdmaActionIterator<'a> {
    /// Get an empty Iterator
    ///
    /// This can for example be used to have a default value in chained `if`
    /// statements.
    pub fn empty() -> Self {
        Self {
            internal: ArrayVec::new().into_iter().fuse(),
        }
    }

    pub(super) fn from(list: ArrayVec<TdmaAction<'a>, MAX_ACTIONS>) -> Self {
        Self {
            internal: list.into_iter().fuse(),
        }
    }
}

impl<'a> Iterator for TdmaActionIterator<'a> {
    type Item = TdmaAction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.internal.next()
    }
}
