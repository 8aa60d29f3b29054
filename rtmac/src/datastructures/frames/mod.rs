//! TDMA control frames

pub(crate) use ack_conf::*;
pub(crate) use calibration::*;
pub use header::TDMA_VERSION;
pub(crate) use header::Header;
pub(crate) use station_list::*;
pub(crate) use sync::*;
pub(crate) use test::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{
    common::{CycleParameters, StationTable},
    WireFormatError,
};

mod ack_conf;
mod calibration;
mod header;
mod station_list;
mod sync;

/// Maximum length of a frame
///
/// This can be used to preallocate buffers that can always fit frames sent by
/// `rtmac`.
pub const MAX_DATA_LEN: usize = 512;

/// Ethertype under which TDMA control frames are exchanged
pub const RTMAC_ETHERTYPE: u16 = 0x9031;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FrameId {
    Sync = 0x0000,
    CalibrationRequest = 0x0010,
    CalibrationReply = 0x0011,
    Conf = 0x0020,
    AckConf = 0x0021,
    AckAckConf = 0x0022,
    Test = 0x0030,
    AckTest = 0x0031,
    StationList = 0x0040,
    ChangeOffset = 0x0041,
}

#[cfg(feature = "fuzz")]
pub use fuzz::FuzzFrame;

#[cfg(feature = "fuzz")]
mod fuzz {
    #![allow(missing_docs)] // These are only used for internal fuzzing
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FuzzFrame {
        inner: Frame,
    }

    impl FuzzFrame {
        pub fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError> {
            Ok(FuzzFrame {
                inner: Frame::deserialize(buffer)?,
            })
        }

        pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WireFormatError> {
            self.inner.serialize(buffer)
        }

        pub fn frame_id(&self) -> FrameId {
            self.inner.frame_id()
        }
    }
}

/// A decoded TDMA frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) header: Header,
    pub(crate) body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameBody {
    Sync(SyncFrame),
    CalibrationRequest(CalibrationRequest),
    CalibrationReply(CalibrationReply),
    Conf(ConfFrame),
    AckConf(AckConfFrame),
    AckAckConf(AckAckConfFrame),
    Test(TestFrame),
    AckTest(AckTestFrame),
    StationList(StationListFrame),
    ChangeOffset(ChangeOffsetFrame),
}

impl FrameBody {
    fn wire_size(&self) -> usize {
        match self {
            FrameBody::Sync(m) => m.content_size(),
            FrameBody::CalibrationRequest(m) => m.content_size(),
            FrameBody::CalibrationReply(m) => m.content_size(),
            FrameBody::Conf(m) => m.content_size(),
            FrameBody::AckConf(m) => m.content_size(),
            FrameBody::AckAckConf(m) => m.content_size(),
            FrameBody::Test(m) => m.content_size(),
            FrameBody::AckTest(m) => m.content_size(),
            FrameBody::StationList(m) => m.content_size(),
            FrameBody::ChangeOffset(m) => m.content_size(),
        }
    }

    fn content_type(&self) -> FrameId {
        match self {
            FrameBody::Sync(_) => FrameId::Sync,
            FrameBody::CalibrationRequest(_) => FrameId::CalibrationRequest,
            FrameBody::CalibrationReply(_) => FrameId::CalibrationReply,
            FrameBody::Conf(_) => FrameId::Conf,
            FrameBody::AckConf(_) => FrameId::AckConf,
            FrameBody::AckAckConf(_) => FrameId::AckAckConf,
            FrameBody::Test(_) => FrameId::Test,
            FrameBody::AckTest(_) => FrameId::AckTest,
            FrameBody::StationList(_) => FrameId::StationList,
            FrameBody::ChangeOffset(_) => FrameId::ChangeOffset,
        }
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WireFormatError> {
        match self {
            FrameBody::Sync(m) => m.serialize_content(buffer)?,
            FrameBody::CalibrationRequest(m) => m.serialize_content(buffer)?,
            FrameBody::CalibrationReply(m) => m.serialize_content(buffer)?,
            FrameBody::Conf(m) => m.serialize_content(buffer)?,
            FrameBody::AckConf(m) => m.serialize_content(buffer)?,
            FrameBody::AckAckConf(m) => m.serialize_content(buffer)?,
            FrameBody::Test(m) => m.serialize_content(buffer)?,
            FrameBody::AckTest(m) => m.serialize_content(buffer)?,
            FrameBody::StationList(m) => m.serialize_content(buffer)?,
            FrameBody::ChangeOffset(m) => m.serialize_content(buffer)?,
        }

        Ok(self.wire_size())
    }

    fn deserialize(frame_id: FrameId, buffer: &[u8]) -> Result<Self, WireFormatError> {
        let body = match frame_id {
            FrameId::Sync => FrameBody::Sync(SyncFrame::deserialize_content(buffer)?),
            FrameId::CalibrationRequest => {
                FrameBody::CalibrationRequest(CalibrationRequest::deserialize_content(buffer)?)
            }
            FrameId::CalibrationReply => {
                FrameBody::CalibrationReply(CalibrationReply::deserialize_content(buffer)?)
            }
            FrameId::Conf => FrameBody::Conf(ConfFrame::deserialize_content(buffer)?),
            FrameId::AckConf => FrameBody::AckConf(AckConfFrame::deserialize_content(buffer)?),
            FrameId::AckAckConf => {
                FrameBody::AckAckConf(AckAckConfFrame::deserialize_content(buffer)?)
            }
            FrameId::Test => FrameBody::Test(TestFrame::deserialize_content(buffer)?),
            FrameId::AckTest => FrameBody::AckTest(AckTestFrame::deserialize_content(buffer)?),
            FrameId::StationList => {
                FrameBody::StationList(StationListFrame::deserialize_content(buffer)?)
            }
            FrameId::ChangeOffset => {
                FrameBody::ChangeOffset(ChangeOffsetFrame::deserialize_content(buffer)?)
            }
        };

        Ok(body)
    }
}

impl Frame {
    pub(crate) fn new(body: FrameBody) -> Self {
        Frame {
            header: Header::new(body.content_type()),
            body,
        }
    }

    pub(crate) fn sync(cycle_no: u64, xmit_stamp: u64, sched_xmit_stamp: u64) -> Self {
        Self::new(FrameBody::Sync(SyncFrame {
            cycle_no: cycle_no as u16,
            xmit_stamp,
            sched_xmit_stamp,
        }))
    }

    pub(crate) fn calibration_request(xmit_stamp: u64, reply_cycle: u16) -> Self {
        Self::new(FrameBody::CalibrationRequest(CalibrationRequest {
            xmit_stamp,
            reply_cycle,
        }))
    }

    pub(crate) fn calibration_reply(
        request_xmit_stamp: u64,
        reception_stamp: u64,
        xmit_stamp: u64,
    ) -> Self {
        Self::new(FrameBody::CalibrationReply(CalibrationReply {
            request_xmit_stamp,
            reception_stamp,
            xmit_stamp,
        }))
    }

    pub(crate) fn conf(params: CycleParameters, stations: StationTable) -> Self {
        Self::new(FrameBody::Conf(ConfFrame { params, stations }))
    }

    pub(crate) fn ack_conf(cycle_period_ns: u64, offset_ns: u32) -> Self {
        Self::new(FrameBody::AckConf(AckConfFrame {
            cycle_period_ns,
            offset_ns,
        }))
    }

    pub(crate) fn ack_ack_conf(offset_ns: u32) -> Self {
        Self::new(FrameBody::AckAckConf(AckAckConfFrame { offset_ns }))
    }

    pub(crate) fn test(counter: u32, xmit_stamp: u64) -> Self {
        Self::new(FrameBody::Test(TestFrame {
            counter,
            xmit_stamp,
        }))
    }

    pub(crate) fn ack_test(
        counter: u32,
        request_xmit_stamp: u64,
        reception_stamp: u64,
        xmit_stamp: u64,
    ) -> Self {
        Self::new(FrameBody::AckTest(AckTestFrame {
            counter,
            request_xmit_stamp,
            reception_stamp,
            xmit_stamp,
        }))
    }

    pub(crate) fn station_list(params: CycleParameters, stations: StationTable) -> Self {
        Self::new(FrameBody::StationList(StationListFrame { params, stations }))
    }

    pub(crate) fn change_offset(offset_ns: u32) -> Self {
        Self::new(FrameBody::ChangeOffset(ChangeOffsetFrame { offset_ns }))
    }

    pub fn frame_id(&self) -> FrameId {
        self.header.frame_id
    }

    pub fn wire_size(&self) -> usize {
        self.header.wire_size() + self.body.wire_size()
    }

    /// Serializes the frame into the start of `buffer`, returning the number
    /// of bytes written
    pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WireFormatError> {
        if buffer.len() < self.wire_size() {
            return Err(WireFormatError::BufferTooShort);
        }

        let (header, rest) = buffer.split_at_mut(self.header.wire_size());
        self.header.serialize_header(header)?;
        let body_size = self.body.serialize(rest)?;

        Ok(self.header.wire_size() + body_size)
    }

    /// Decodes a frame. Trailing bytes, such as Ethernet padding, are
    /// ignored.
    pub fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let header = Header::deserialize_header(buffer)?;
        let body = FrameBody::deserialize(header.frame_id, &buffer[header.wire_size()..])?;

        Ok(Frame { header, body })
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[0..8]);
    u64::from_be_bytes(bytes)
}
