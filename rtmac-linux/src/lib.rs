//! Linux runtime and daemon for the `rtmac` TDMA discipline
//!
//! The daemon attaches TDMA to a single station on a segment emulated over
//! UDP multicast, drives it from a tokio event loop and exposes it through a
//! Unix control socket.

pub mod clock;
pub mod config;
pub mod control;
pub mod network;
pub mod observer;
pub mod runtime;
pub mod tracing;
