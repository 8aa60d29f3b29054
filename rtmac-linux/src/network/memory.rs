use rtmac::datastructures::common::StationAddr;
use tokio::sync::{broadcast, Mutex};

use super::{Envelope, PacketIo};

/// A segment that only exists inside the process
#[derive(Debug, Clone)]
pub struct MemorySegment {
    sender: broadcast::Sender<Envelope>,
}

impl MemorySegment {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        MemorySegment { sender }
    }

    /// Attach a station with address `address` to the segment
    pub fn attach(&self, address: StationAddr) -> MemoryPort {
        MemoryPort {
            sender: self.sender.clone(),
            receiver: Mutex::new(self.sender.subscribe()),
            address,
        }
    }
}

impl Default for MemorySegment {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MemoryPort {
    sender: broadcast::Sender<Envelope>,
    receiver: Mutex<broadcast::Receiver<Envelope>>,
    address: StationAddr,
}

impl PacketIo for MemoryPort {
    async fn send(&self, envelope: &Envelope) -> std::io::Result<()> {
        // Our own receiver is always subscribed, so this cannot fail
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Envelope> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(envelope) if envelope.is_for(self.address) => return Ok(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!("{} dropped {} frames", self.address, count);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(std::io::ErrorKind::BrokenPipe.into())
                }
            }
        }
    }
}
