use core::{fmt::Display, str::FromStr};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::datastructures::{WireFormat, WireFormatError};

/// The address of a station on the segment.
///
/// Stations are identified by the MAC address of the interface the TDMA
/// discipline is attached to.
///
/// # Example
/// ```
/// # use rtmac::datastructures::common::StationAddr;
/// let addr: StationAddr = "02:00:00:00:00:0a".parse().unwrap();
/// assert_eq!(addr.0, [2, 0, 0, 0, 0, 10]);
/// assert_eq!(addr.to_string(), "02:00:00:00:00:0a");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct StationAddr(pub [u8; 6]);

impl StationAddr {
    /// The Ethernet broadcast address
    pub const BROADCAST: StationAddr = StationAddr([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl WireFormat for StationAddr {
    fn wire_size(&self) -> usize {
        6
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        buffer
            .get_mut(0..6)
            .ok_or(WireFormatError::BufferTooShort)?
            .copy_from_slice(&self.0);
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError> {
        match buffer.get(0..6) {
            Some(buf) => {
                let mut addr = [0; 6];
                addr.copy_from_slice(buf);
                Ok(Self(addr))
            }
            None => Err(WireFormatError::BufferTooShort),
        }
    }
}

impl Display for StationAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, val) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }

            write!(f, "{:02x}", val)?;
        }

        Ok(())
    }
}

/// A station address could not be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrParseError;

impl Display for AddrParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("invalid station address, expected six colon separated hex bytes")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AddrParseError {}

impl FromStr for StationAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.split(':');

        for byte in addr.iter_mut() {
            let part = parts.next().ok_or(AddrParseError)?;
            if part.len() != 2 {
                return Err(AddrParseError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddrParseError)?;
        }

        match parts.next() {
            Some(_) => Err(AddrParseError),
            None => Ok(StationAddr(addr)),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for StationAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for StationAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddrVisitor;

        impl<'de> serde::de::Visitor<'de> for AddrVisitor {
            type Value = StationAddr;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a station address like 02:00:00:00:00:01")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(|_| E::custom(AddrParseError))
            }
        }

        deserializer.deserialize_str(AddrVisitor)
    }
}

/// Whether a station transmits real-time traffic in a fixed slot, or only
/// takes part in the non-real-time window at the tail of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum StationKind {
    Rt = 1,
    Nrt = 2,
}

impl Display for StationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StationKind::Rt => f.write_str("RT"),
            StationKind::Nrt => f.write_str("NRT"),
        }
    }
}

/// One entry of the station list as carried in CONF and STATION_LIST frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationEntry {
    pub address: StationAddr,
    pub kind: StationKind,
    /// Offset of the transmit slot from the cycle start. NRT stations carry
    /// the start of the non-real-time window here.
    pub offset_ns: u32,
}

impl WireFormat for StationEntry {
    fn wire_size(&self) -> usize {
        12
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<(), WireFormatError> {
        let buffer = buffer
            .get_mut(0..12)
            .ok_or(WireFormatError::BufferTooShort)?;
        self.address.serialize(&mut buffer[0..6])?;
        buffer[6] = self.kind.into();
        buffer[7] = 0;
        buffer[8..12].copy_from_slice(&self.offset_ns.to_be_bytes());
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, WireFormatError> {
        let buf = buffer.get(0..12).ok_or(WireFormatError::BufferTooShort)?;
        Ok(Self {
            address: StationAddr::deserialize(&buf[0..6])?,
            kind: StationKind::try_from(buf[6]).map_err(|_| WireFormatError::EnumConversionError)?,
            offset_ns: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wireformat() {
        let representations = [
            (
                [2, 0, 0, 0, 0, 7, 1, 0, 0x00, 0x0f, 0x42, 0x40u8],
                StationEntry {
                    address: StationAddr([2, 0, 0, 0, 0, 7]),
                    kind: StationKind::Rt,
                    offset_ns: 1_000_000,
                },
            ),
            (
                [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 2, 0, 0, 0, 0, 0u8],
                StationEntry {
                    address: StationAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
                    kind: StationKind::Nrt,
                    offset_ns: 0,
                },
            ),
        ];

        for (byte_representation, object_representation) in representations {
            let mut serialization_buffer = [0xff; 12];
            object_representation
                .serialize(&mut serialization_buffer)
                .unwrap();
            assert_eq!(serialization_buffer, byte_representation);

            let deserialized_data = StationEntry::deserialize(&byte_representation).unwrap();
            assert_eq!(deserialized_data, object_representation);
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let bytes = [2, 0, 0, 0, 0, 7, 9, 0, 0, 0, 0, 0u8];
        assert_eq!(
            StationEntry::deserialize(&bytes),
            Err(WireFormatError::EnumConversionError)
        );
        assert_eq!(
            StationEntry::deserialize(&bytes[..11]),
            Err(WireFormatError::BufferTooShort)
        );
    }

    #[test]
    fn parse_addr() {
        assert_eq!(
            "02:00:00:00:00:01".parse(),
            Ok(StationAddr([2, 0, 0, 0, 0, 1]))
        );
        assert_eq!("02:00:00:00:00".parse::<StationAddr>(), Err(AddrParseError));
        assert_eq!(
            "02:00:00:00:00:01:03".parse::<StationAddr>(),
            Err(AddrParseError)
        );
        assert_eq!("02:00:00:00:00:zz".parse::<StationAddr>(), Err(AddrParseError));
        assert!(StationAddr::BROADCAST.is_broadcast());
    }
}
