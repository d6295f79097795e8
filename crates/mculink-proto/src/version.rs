use std::fmt;

use serde::Serialize;

/// Firmware version as carried on the wire: major and minor are single
/// bytes, the build number is little-endian u16.
///
/// Ordering is derived field order, so `major` dominates, then `minor`,
/// then `build`. Control byte layouts are selected by comparing against
/// the named constants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl FirmwareVersion {
    pub const V0_7: Self = Self::new(0, 7, 0);
    pub const V0_8: Self = Self::new(0, 8, 0);
    pub const V1_0: Self = Self::new(1, 0, 0);

    pub const fn new(major: u8, minor: u8, build: u16) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    pub fn from_bytes(raw: [u8; 4]) -> Self {
        Self::new(raw[0], raw[1], u16::from_le_bytes([raw[2], raw[3]]))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let build = self.build.to_le_bytes();
        [self.major, self.minor, build[0], build[1]]
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}.{}.{}", self.major, self.minor, self.build)
    }
}
