use crate::datastructures::WireFormatError;

/// Opens every cycle. Sent by the master at the scheduled cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SyncFrame {
    /// Lower 16 bits of the cycle number
    pub(crate) cycle_no: u16,
    /// Actual transmission time on the master clock
    pub(crate) xmit_stamp: u64,
    /// Scheduled transmission time, the cycle start on the master clock
    pub(crate) sched_xmit_stamp: u64,
}

impl SyncFrame {
    pub(crate) fn content_size(&self) -> usize {
        18
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer.get_mut(0..18).ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..2].copy_from_slice(&self.cycle_no.to_be_bytes());
        buffer[2..10].copy_from_slice(&self.xmit_stamp.to_be_bytes());
        buffer[10..18].copy_from_slice(&self.sched_xmit_stamp.to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..18).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            cycle_no: u16::from_be_bytes([buf[0], buf[1]]),
            xmit_stamp: super::read_u64(&buf[2..10]),
            sched_xmit_stamp: super::read_u64(&buf[10..18]),
        })
    }
}
