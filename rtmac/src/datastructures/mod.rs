//! General datastructures as used on the wire by the TDMA discipline

use core::fmt::Debug;

pub mod common;
pub mod frames;

/// Errors that can occur while encoding or decoding TDMA frames
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum WireFormatError {
    #[cfg_attr(feature = "std", error("enum conversion failed"))]
    EnumConversionError,
    #[cfg_attr(feature = "std", error("a buffer is too short"))]
    BufferTooShort,
    #[cfg_attr(feature = "std", error("unsupported frame version {0:#06x}"))]
    UnsupportedVersion(u16),
    #[cfg_attr(feature = "std", error("unknown frame id {0:#06x}"))]
    UnknownFrameId(u16),
    #[cfg_attr(feature = "std", error("station list exceeds the maximum number of stations"))]
    TooManyStations,
}

#[cfg(not(feature = "std"))]
impl core::fmt::Display for WireFormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WireFormatError::EnumConversionError => f.write_str("enum conversion failed"),
            WireFormatError::BufferTooShort => f.write_str("a buffer is too short"),
            WireFormatError::UnsupportedVersion(v) => {
                write!(f, "unsupported frame version {v:#06x}")
            }
            WireFormatError::UnknownFrameId(id) => write!(f, "unknown frame id {id:#06x}"),
            WireFormatError::TooManyStations => {
                f.write_str("station list exceeds the maximum number of stations")
            }
        }
    }
}

trait WireFormat: Debug + Clone + Eq {
    /// The byte size on the wire of this object
    fn wire_size(&self) -> usize;

    /// Serializes the object into the start of `buffer`
    fn serialize(&self, buffer: &mut [u8]) -> Result<(), WireFormatError>;

    /// Deserializes the object from the start of `buffer`
    fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError>;
}
