//! Register control byte packing.
//!
//! The control byte changed layout across firmware generations. Before 0.7
//! it carried a write flag, a value-source tag and the dereference depth;
//! 0.8 and 1.0 replaced the high bits with a two-bit access direction.
//! Versions outside that set are refused outright.

use serde::Serialize;

use crate::error::{ProtoError, Result};
use crate::version::FirmwareVersion;

/// Register access direction. The two bits are independent flags:
/// bit 0 grants writes, bit 1 grants reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Direction {
    Write = 1,
    Read = 2,
    ReadWrite = 3,
}

impl Direction {
    pub fn is_readable(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            1 => Some(Direction::Write),
            2 => Some(Direction::Read),
            3 => Some(Direction::ReadWrite),
            _ => None,
        }
    }
}

/// Where a register definition came from. Occupies bits 6:4 of the
/// pre-0.7 control byte; later layouts imply `ElfParsed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ValueSource {
    HandwrittenOffset = 0x00,
    HandwrittenIndex = 0x10,
    SimulinkCApiOffset = 0x40,
    SimulinkCApiIndex = 0x50,
    ElfParsed = 0x70,
}

impl ValueSource {
    fn from_bits(byte: u8) -> Self {
        match byte & 0x70 {
            0x10 => ValueSource::HandwrittenIndex,
            0x40 => ValueSource::SimulinkCApiOffset,
            0x50 => ValueSource::SimulinkCApiIndex,
            0x70 => ValueSource::ElfParsed,
            _ => ValueSource::HandwrittenOffset,
        }
    }
}

/// Decoded form of the wire control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub direction: Direction,
    pub source: ValueSource,
    pub deref_depth: u8,
}

impl Control {
    pub fn new(direction: Direction, source: ValueSource, deref_depth: u8) -> Self {
        Self {
            direction,
            source,
            deref_depth,
        }
    }

    pub fn pack(self, version: FirmwareVersion) -> Result<u8> {
        if version < FirmwareVersion::V0_7 {
            let mut byte = if self.direction.is_writable() {
                0b1000_0000
            } else {
                0
            };
            byte |= self.source as u8;
            byte |= self.deref_depth & 0x0F;
            Ok(byte)
        } else if version == FirmwareVersion::V0_8 || version == FirmwareVersion::V1_0 {
            Ok(((self.direction as u8) << 6) | (self.deref_depth & 0x0F))
        } else {
            Err(ProtoError::UnsupportedVersion(version))
        }
    }

    pub fn unpack(version: FirmwareVersion, byte: u8) -> Result<Self> {
        if version < FirmwareVersion::V0_7 {
            let direction = if byte >> 7 == 1 {
                Direction::Write
            } else {
                Direction::Read
            };
            Ok(Self::new(direction, ValueSource::from_bits(byte), byte & 0x0F))
        } else if version == FirmwareVersion::V0_8 || version == FirmwareVersion::V1_0 {
            let direction =
                Direction::from_bits(byte >> 6).ok_or(ProtoError::MalformedControl(byte))?;
            Ok(Self::new(direction, ValueSource::ElfParsed, byte & 0x0F))
        } else {
            Err(ProtoError::UnsupportedVersion(version))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_layout_carries_source_and_write_flag() {
        let ctrl = Control::new(Direction::Write, ValueSource::SimulinkCApiOffset, 2);
        let byte = ctrl.pack(FirmwareVersion::new(0, 6, 0)).unwrap();
        assert_eq!(byte, 0b1100_0010);

        let back = Control::unpack(FirmwareVersion::new(0, 6, 0), byte).unwrap();
        assert_eq!(back.direction, Direction::Write);
        assert_eq!(back.source, ValueSource::SimulinkCApiOffset);
        assert_eq!(back.deref_depth, 2);
    }

    #[test]
    fn v1_layout_uses_direction_bits() {
        let ctrl = Control::new(Direction::ReadWrite, ValueSource::ElfParsed, 3);
        let byte = ctrl.pack(FirmwareVersion::V1_0).unwrap();
        assert_eq!(byte, 0b1100_0011);

        let back = Control::unpack(FirmwareVersion::V1_0, byte).unwrap();
        assert_eq!(back.direction, Direction::ReadWrite);
        assert_eq!(back.source, ValueSource::ElfParsed);
        assert_eq!(back.deref_depth, 3);
    }

    #[test]
    fn v08_and_v10_agree() {
        let ctrl = Control::new(Direction::Read, ValueSource::ElfParsed, 0);
        assert_eq!(
            ctrl.pack(FirmwareVersion::V0_8).unwrap(),
            ctrl.pack(FirmwareVersion::V1_0).unwrap()
        );
    }

    #[test]
    fn unknown_version_is_refused() {
        let ctrl = Control::new(Direction::Read, ValueSource::ElfParsed, 0);
        assert!(matches!(
            ctrl.pack(FirmwareVersion::new(0, 9, 0)),
            Err(ProtoError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            Control::unpack(FirmwareVersion::new(2, 0, 0), 0x80),
            Err(ProtoError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn zero_direction_bits_are_malformed() {
        assert!(matches!(
            Control::unpack(FirmwareVersion::V1_0, 0x05),
            Err(ProtoError::MalformedControl(0x05))
        ));
    }
}
