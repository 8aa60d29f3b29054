//! rtmac is a library providing a deterministic medium access discipline for
//! real-time Ethernet. It implements time division multiple access (TDMA): one
//! station is elected time master and opens every cycle with a SYNC frame,
//! other stations are admitted as clients through a configuration handshake,
//! keep their notion of the cycle start aligned with the master and only
//! transmit in their own slot.
//!
//! # Device interfaces
//! `rtmac` is designed to be able to work with many different underlying
//! platforms, including embedded targets. It therefore does no I/O of its
//! own. The embedding runtime provides the current time through the [`Clock`]
//! trait, delivers received frames, timer expiries and cycle ticks to a
//! [`TdmaInstance`], and performs the [`TdmaAction`](tdma::TdmaAction)s that
//! the instance returns: sending frames, arming or canceling its timer and
//! releasing tasks waiting for the cycle.
//!
//! The `rtmac-linux` crate provides a ready to use runtime for Linux that
//! emulates an Ethernet segment over UDP multicast.
//!
//! # Structure
//! * [`datastructures`]: the on-the-wire representation of TDMA frames
//! * [`clock`]: the clock abstraction and the model tracking the offset to the
//!   master
//! * [`scheduler`]: cycle timing and application wake-up
//! * [`tdma`]: the TDMA state machine and the admission protocol
//! * [`discipline`]: the adapter that attaches a discipline to an interface
//! * [`observability`]: read-only snapshots for diagnostics

#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod clock;
pub mod config;
pub mod datastructures;
pub mod discipline;
pub mod observability;
pub mod scheduler;
pub mod tdma;
pub mod time;

pub use clock::Clock;
pub use discipline::Discipline;
pub use tdma::TdmaInstance;

#[cfg(feature = "fuzz")]
pub mod fuzz {
    pub use crate::datastructures::frames::FuzzFrame;
}
