//! Attaching a medium access discipline to an interface
//!
//! An interface either runs the TDMA discipline or is left unmanaged, in
//! which case frames pass straight through. The [`Discipline`] routes
//! received frames and tells the runtime when application frames may be
//! transmitted.

use arrayvec::ArrayVec;
use rand::Rng;

use crate::{
    clock::Clock,
    config::{TdmaConfig, MAX_MASTER_SLOTS},
    datastructures::{common::StationAddr, frames::RTMAC_ETHERTYPE},
    tdma::{TdmaActionIterator, TdmaInstance},
    time::{Duration, Time},
};

/// The discipline of one interface
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Discipline<C, R> {
    Tdma(TdmaInstance<C, R>),
    Unmanaged,
}

/// What happened to a received frame
#[derive(Debug)]
#[must_use]
pub enum RxOutcome<'a> {
    /// The frame was meant for the discipline. The actions have to be
    /// performed as for any other event.
    Consumed(TdmaActionIterator<'a>),
    /// The frame belongs to the layers above
    Pass,
}

/// When outbound application frames may go on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TxPolicy {
    /// Transmit right away
    Immediate,
    /// Queue until the next transmit slot of this station is released
    OwnSlot,
    /// The station has no slot, frames are dropped
    Drop,
}

impl<C, R> Discipline<C, R> {
    /// Attach the TDMA discipline. The instance starts in the `Down` state.
    pub fn attach(config: TdmaConfig, clock: C, rng: R) -> Self {
        log::info!("Attaching TDMA to {}", config.station_address);
        Discipline::Tdma(TdmaInstance::new(config, clock, rng))
    }

    pub fn instance(&self) -> Option<&TdmaInstance<C, R>> {
        match self {
            Discipline::Tdma(instance) => Some(instance),
            Discipline::Unmanaged => None,
        }
    }

    pub fn instance_mut(&mut self) -> Option<&mut TdmaInstance<C, R>> {
        match self {
            Discipline::Tdma(instance) => Some(instance),
            Discipline::Unmanaged => None,
        }
    }

    pub fn tx_policy(&self) -> TxPolicy {
        match self {
            Discipline::Unmanaged => TxPolicy::Immediate,
            Discipline::Tdma(instance) if instance.is_cycling() => TxPolicy::OwnSlot,
            Discipline::Tdma(_) => TxPolicy::Drop,
        }
    }

    /// Offsets of the transmit slots of this station. Empty when unmanaged.
    pub fn tx_slots(&self) -> ArrayVec<Duration, MAX_MASTER_SLOTS> {
        match self {
            Discipline::Tdma(instance) => instance.transmit_slots(),
            Discipline::Unmanaged => ArrayVec::new(),
        }
    }
}

impl<C: Clock, R: Rng> Discipline<C, R> {
    /// Take the TDMA instance down and leave the interface unmanaged
    pub fn detach(&mut self) -> TdmaActionIterator<'static> {
        let actions = match self {
            Discipline::Tdma(instance) => {
                log::info!("Detaching TDMA from {}", instance.config().station_address);
                instance.down()
            }
            Discipline::Unmanaged => TdmaActionIterator::empty(),
        };

        *self = Discipline::Unmanaged;
        actions
    }

    /// Route a received frame
    pub fn rx(
        &mut self,
        ethertype: u16,
        data: &[u8],
        source: StationAddr,
        timestamp: Time,
    ) -> RxOutcome<'_> {
        match self {
            Discipline::Tdma(instance) if ethertype == RTMAC_ETHERTYPE => {
                RxOutcome::Consumed(instance.handle_receive(data, source, timestamp))
            }
            _ => RxOutcome::Pass,
        }
    }
}
