//! Packet I/O for the daemon
//!
//! The daemon does not need raw sockets. An Ethernet segment is emulated by
//! wrapping every frame in a small envelope carrying the link layer header
//! and exchanging the envelopes over UDP multicast. Tests use an in-memory
//! segment instead.

use std::future::Future;

use rtmac::datastructures::common::StationAddr;

mod memory;
mod udp;

pub use memory::{MemoryPort, MemorySegment};
pub use udp::UdpPort;

/// Size of the emulated link layer header: destination, source, ethertype
pub const ENVELOPE_HEADER_LEN: usize = 14;

/// A frame as it travels over the emulated segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: StationAddr,
    pub source: StationAddr,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        buffer.extend_from_slice(&self.destination.0);
        buffer.extend_from_slice(&self.source.0);
        buffer.extend_from_slice(&self.ethertype.to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    pub fn deserialize(data: &[u8]) -> Option<Envelope> {
        if data.len() < ENVELOPE_HEADER_LEN {
            return None;
        }

        let (header, payload) = data.split_at(ENVELOPE_HEADER_LEN);
        Some(Envelope {
            destination: StationAddr(header[0..6].try_into().ok()?),
            source: StationAddr(header[6..12].try_into().ok()?),
            ethertype: u16::from_be_bytes([header[12], header[13]]),
            payload: payload.to_vec(),
        })
    }

    /// Whether a station with address `station` would accept this frame
    pub fn is_for(&self, station: StationAddr) -> bool {
        self.source != station
            && (self.destination == station || self.destination.is_broadcast())
    }
}

/// Access to the segment for a single station
///
/// Both directions only need a shared reference, so one port can be used by
/// the receive task and the event loop at the same time.
pub trait PacketIo: Send + Sync + 'static {
    /// Put a frame on the segment
    fn send(&self, envelope: &Envelope) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Wait for the next frame addressed to this station
    fn recv(&self) -> impl Future<Output = std::io::Result<Envelope>> + Send;
}
