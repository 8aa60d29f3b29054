use crate::datastructures::WireFormatError;

/// Sent by a client to measure the path delay to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalibrationRequest {
    /// t1, local clock of the client
    pub(crate) xmit_stamp: u64,
    /// Cycle in which the reply is expected
    pub(crate) reply_cycle: u16,
}

impl CalibrationRequest {
    pub(crate) fn content_size(&self) -> usize {
        10
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer.get_mut(0..10).ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..8].copy_from_slice(&self.xmit_stamp.to_be_bytes());
        buffer[8..10].copy_from_slice(&self.reply_cycle.to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..10).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            xmit_stamp: super::read_u64(&buf[0..8]),
            reply_cycle: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}

/// The master's answer to a [`CalibrationRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalibrationReply {
    /// t1, echoed from the request
    pub(crate) request_xmit_stamp: u64,
    /// t2, master clock
    pub(crate) reception_stamp: u64,
    /// t3, master clock
    pub(crate) xmit_stamp: u64,
}

impl CalibrationReply {
    pub(crate) fn content_size(&self) -> usize {
        24
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer.get_mut(0..24).ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..8].copy_from_slice(&self.request_xmit_stamp.to_be_bytes());
        buffer[8..16].copy_from_slice(&self.reception_stamp.to_be_bytes());
        buffer[16..24].copy_from_slice(&self.xmit_stamp.to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..24).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            request_xmit_stamp: super::read_u64(&buf[0..8]),
            reception_stamp: super::read_u64(&buf[8..16]),
            xmit_stamp: super::read_u64(&buf[16..24]),
        })
    }
}
