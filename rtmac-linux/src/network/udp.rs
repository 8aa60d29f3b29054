use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use rtmac::datastructures::common::StationAddr;
use tokio::net::UdpSocket;

use super::{Envelope, PacketIo, ENVELOPE_HEADER_LEN};

/// Largest envelope: an Ethernet payload plus the emulated header
const MAX_ENVELOPE_LEN: usize = 1500 + ENVELOPE_HEADER_LEN;

/// A station on a segment emulated over UDP multicast
#[derive(Debug)]
pub struct UdpPort {
    socket: UdpSocket,
    group: SocketAddrV4,
    address: StationAddr,
}

impl UdpPort {
    /// Join the multicast `group` on the interface with address `interface`
    pub async fn open(
        group: SocketAddrV4,
        interface: Ipv4Addr,
        address: StationAddr,
    ) -> std::io::Result<UdpPort> {
        let socket =
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()))).await?;
        socket.join_multicast_v4(*group.ip(), interface)?;
        // Stations on the same host share the segment
        socket.set_multicast_loop_v4(true)?;

        tracing::info!("Joined segment {} as {}", group, address);

        Ok(UdpPort {
            socket,
            group,
            address,
        })
    }
}

impl PacketIo for UdpPort {
    async fn send(&self, envelope: &Envelope) -> std::io::Result<()> {
        self.socket
            .send_to(&envelope.serialize(), SocketAddr::V4(self.group))
            .await?;
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Envelope> {
        let mut buffer = [0u8; MAX_ENVELOPE_LEN];
        loop {
            let (len, sender) = self.socket.recv_from(&mut buffer).await?;
            let Some(envelope) = Envelope::deserialize(&buffer[..len]) else {
                tracing::debug!("Ignoring runt datagram from {}", sender);
                continue;
            };

            if envelope.is_for(self.address) {
                return Ok(envelope);
            }
        }
    }
}
