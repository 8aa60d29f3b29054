use super::FrameId;
use crate::datastructures::WireFormatError;

/// Version tag carried by every frame of this implementation
pub const TDMA_VERSION: u16 = 0x0201;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u16,
    pub(crate) frame_id: FrameId,
}

impl Header {
    pub(crate) fn new(frame_id: FrameId) -> Self {
        Self {
            version: TDMA_VERSION,
            frame_id,
        }
    }

    pub(crate) fn wire_size(&self) -> usize {
        4
    }

    pub(crate) fn serialize_header(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer.get_mut(0..4).ok_or(WireFormatError::BufferTooShort)?;
        buffer[0..2].copy_from_slice(&self.version.to_be_bytes());
        buffer[2..4].copy_from_slice(&u16::from(self.frame_id).to_be_bytes());
        Ok(())
    }

    pub(crate) fn deserialize_header(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..4).ok_or(WireFormatError::BufferTooShort)?;

        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != TDMA_VERSION {
            return Err(WireFormatError::UnsupportedVersion(version));
        }

        let raw_id = u16::from_be_bytes([buf[2], buf[3]]);
        let frame_id =
            FrameId::try_from(raw_id).map_err(|_| WireFormatError::UnknownFrameId(raw_id))?;

        Ok(Self { version, frame_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wireformat() {
        let representations = [
            ([0x02, 0x01, 0x00, 0x00u8], Header::new(FrameId::Sync)),
            ([0x02, 0x01, 0x00, 0x21u8], Header::new(FrameId::AckConf)),
            ([0x02, 0x01, 0x00, 0x41u8], Header::new(FrameId::ChangeOffset)),
        ];

        for (byte_representation, object_representation) in representations {
            let mut serialization_buffer = [0; 4];
            object_representation
                .serialize_header(&mut serialization_buffer)
                .unwrap();
            assert_eq!(serialization_buffer, byte_representation);

            let deserialized_data = Header::deserialize_header(&byte_representation).unwrap();
            assert_eq!(deserialized_data, object_representation);
        }
    }

    #[test]
    fn foreign_headers_rejected() {
        assert_eq!(
            Header::deserialize_header(&[0x01, 0x01, 0x00, 0x00]),
            Err(WireFormatError::UnsupportedVersion(0x0101))
        );
        assert_eq!(
            Header::deserialize_header(&[0x02, 0x01, 0x00, 0x99]),
            Err(WireFormatError::UnknownFrameId(0x0099))
        );
        assert_eq!(
            Header::deserialize_header(&[0x02, 0x01, 0x00]),
            Err(WireFormatError::BufferTooShort)
        );
    }
}
