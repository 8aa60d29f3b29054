use crate::datastructures::{WireFormat, WireFormatError};

/// Timing parameters of the TDMA cycle, as distributed by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleParameters {
    pub cycle_period_ns: u64,
    /// Maximum non-real-time payload per cycle in bytes
    pub mtu: u16,
    /// Start of the non-real-time window relative to the cycle start
    pub nrt_offset_ns: u32,
}

impl WireFormat for CycleParameters {
    fn wire_size(&self) -> usize {
        14
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer
            .get_mut(0..14)
            .ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..8].copy_from_slice(&self.cycle_period_ns.to_be_bytes());
        buffer[8..10].copy_from_slice(&self.mtu.to_be_bytes());
        buffer[10..14].copy_from_slice(&self.nrt_offset_ns.to_be_bytes());
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..14).ok_or(WireFormatError::BufferTooShort)?;
        let mut period = [0; 8];
        period.copy_from_slice(&buf[0..8]);
        Ok(Self {
            cycle_period_ns: u64::from_be_bytes(period),
            mtu: u16::from_be_bytes([buf[8], buf[9]]),
            nrt_offset_ns: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }
}
