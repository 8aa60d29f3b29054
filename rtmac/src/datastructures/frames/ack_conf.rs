use crate::datastructures::WireFormatError;

/// A client's acceptance of a CONF frame, echoing what it accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckConfFrame {
    pub(crate) cycle_period_ns: u64,
    pub(crate) offset_ns: u32,
}

impl AckConfFrame {
    pub(crate) fn content_size(&self) -> usize {
        12
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer.get_mut(0..12).ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..8].copy_from_slice(&self.cycle_period_ns.to_be_bytes());
        buffer[8..12].copy_from_slice(&self.offset_ns.to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..12).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            cycle_period_ns: super::read_u64(&buf[0..8]),
            offset_ns: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// A bare slot offset. Sent as ACK_ACK_CONF to confirm the admission of a
/// client, and as CHANGE_OFFSET to move a client to another slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OffsetFrame {
    pub(crate) offset_ns: u32,
}

pub(crate) type AckAckConfFrame = OffsetFrame;
pub(crate) type ChangeOffsetFrame = OffsetFrame;

impl OffsetFrame {
    pub(crate) fn content_size(&self) -> usize {
        4
    }

    pub(crate) fn serialize_content(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        buffer
            .get_mut(0..4)
            .ok_or(WireFormatError::BufferTooShort)?
            .copy_from_slice(&self.offset_ns.to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_content(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..4).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            offset_ns: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_conf_wireformat() {
        let bytes = [0, 0, 0, 0, 0, 0x0f, 0x42, 0x40, 0, 0x01, 0x86, 0xa0u8];
        let ack = AckConfFrame {
            cycle_period_ns: 1_000_000,
            offset_ns: 100_000,
        };

        let mut buffer = [0; 12];
        ack.serialize_content(&mut buffer).unwrap();
        assert_eq!(buffer, bytes);
        assert_eq!(AckConfFrame::deserialize_content(&bytes), Ok(ack));
    }

    #[test]
    fn offset_wireformat() {
        let frame = OffsetFrame { offset_ns: 0x01020304 };
        let mut buffer = [0; 4];
        frame.serialize_content(&mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);
        assert_eq!(OffsetFrame::deserialize_content(&buffer), Ok(frame));
        assert_eq!(
            OffsetFrame::deserialize_content(&buffer[..3]),
            Err(WireFormatError::BufferTooShort)
        );
    }
}
