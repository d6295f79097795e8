//! Typed application messages layered over raw frame payloads.
//!
//! Constructors take the payload of an already validated frame and enforce
//! the minimum layout for their command. Failures surface as
//! [`ProtoError`] values so a dispatch loop can record a diagnostic and
//! keep going.

use bytes::Bytes;
use mculink_frame::Command;
use serde::Serialize;

use crate::error::{ProtoError, Result};
use crate::types::{ChannelMode, TraceLevel};
use crate::version::FirmwareVersion;

fn sanitize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\t'))
        .collect()
}

/// Identity block a node reports in response to a version request:
/// protocol and application versions, display name and an optional
/// serial number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub protocol: FirmwareVersion,
    pub application: FirmwareVersion,
    pub name: String,
    pub serial: String,
}

impl VersionInfo {
    pub const COMMAND: Command = Command::GetVersion;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 9 {
            return Err(ProtoError::TooShort {
                message: "version",
                need: 9,
                got: payload.len(),
            });
        }
        let protocol =
            FirmwareVersion::from_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let application =
            FirmwareVersion::from_bytes([payload[4], payload[5], payload[6], payload[7]]);

        let name_len = payload[8] as usize;
        let name_end = 9 + name_len;
        if payload.len() < name_end {
            return Err(ProtoError::TooShort {
                message: "version name",
                need: name_end,
                got: payload.len(),
            });
        }
        let name = sanitize(&payload[9..name_end]);

        let serial = if payload.len() > name_end {
            let serial_len = payload[name_end] as usize;
            let serial_end = name_end + 1 + serial_len;
            if payload.len() < serial_end {
                return Err(ProtoError::TooShort {
                    message: "version serial",
                    need: serial_end,
                    got: payload.len(),
                });
            }
            sanitize(&payload[name_end + 1..serial_end])
        } else {
            String::new()
        };

        Ok(Self {
            protocol,
            application,
            name,
            serial,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(10 + self.name.len() + self.serial.len());
        payload.extend_from_slice(&self.protocol.to_bytes());
        payload.extend_from_slice(&self.application.to_bytes());
        payload.push(self.name.len() as u8);
        payload.extend_from_slice(self.name.as_bytes());
        if !self.serial.is_empty() {
            payload.push(self.serial.len() as u8);
            payload.extend_from_slice(self.serial.as_bytes());
        }
        payload
    }
}

/// Write request: target offset, control byte and the value bytes to
/// store. The response to a write is a single status byte, not this
/// shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRegister {
    pub offset: u32,
    pub control: u8,
    pub value: Vec<u8>,
}

impl WriteRegister {
    pub const COMMAND: Command = Command::WriteRegister;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtoError::TooShort {
                message: "write register",
                need: 6,
                got: payload.len(),
            });
        }
        let offset = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let control = payload[4];
        let declared = payload[5] as usize;
        let value = payload[6..].to_vec();
        if value.len() != declared {
            return Err(ProtoError::ValueSizeMismatch {
                declared,
                got: value.len(),
            });
        }
        Ok(Self {
            offset,
            control,
            value,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6 + self.value.len());
        payload.extend_from_slice(&self.offset.to_le_bytes());
        payload.push(self.control);
        payload.push(self.value.len() as u8);
        payload.extend_from_slice(&self.value);
        payload
    }
}

/// Query request or response. A request carries no value bytes; a
/// response repeats the request fields and appends the value read.
/// `size == 0` with an empty value in a response signals a device-side
/// read failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRegister {
    pub offset: u32,
    pub control: u8,
    pub size: u8,
    pub value: Vec<u8>,
}

impl QueryRegister {
    pub const COMMAND: Command = Command::QueryRegister;

    pub fn request(offset: u32, control: u8, size: u8) -> Self {
        Self {
            offset,
            control,
            size,
            value: Vec::new(),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtoError::TooShort {
                message: "query register",
                need: 6,
                got: payload.len(),
            });
        }
        Ok(Self {
            offset: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            control: payload[4],
            size: payload[5],
            value: payload[6..].to_vec(),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6 + self.value.len());
        payload.extend_from_slice(&self.offset.to_le_bytes());
        payload.push(self.control);
        payload.push(self.size);
        payload.extend_from_slice(&self.value);
        payload
    }
}

/// Register binding half of a channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub offset: u32,
    pub control: u8,
    pub size: u8,
}

/// Channel configuration in its three wire shapes: channel index alone
/// (query), index plus mode (mode change), or a full binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChannel {
    pub channel: u8,
    pub mode: Option<ChannelMode>,
    pub binding: Option<ChannelBinding>,
}

impl ConfigChannel {
    pub const COMMAND: Command = Command::ConfigChannel;

    pub fn query(channel: u8) -> Self {
        Self {
            channel,
            mode: None,
            binding: None,
        }
    }

    pub fn set_mode(channel: u8, mode: ChannelMode) -> Self {
        Self {
            channel,
            mode: Some(mode),
            binding: None,
        }
    }

    pub fn bind(channel: u8, mode: ChannelMode, binding: ChannelBinding) -> Self {
        Self {
            channel,
            mode: Some(mode),
            binding: Some(binding),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(ProtoError::TooShort {
                message: "config channel",
                need: 1,
                got: 0,
            });
        }
        let channel = payload[0];
        let mode = if payload.len() >= 2 {
            Some(ChannelMode::from_byte(payload[1])?)
        } else {
            None
        };
        let binding = if payload.len() >= 8 {
            Some(ChannelBinding {
                offset: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
                control: payload[6],
                size: payload[7],
            })
        } else {
            None
        };
        Ok(Self {
            channel,
            mode,
            binding,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.channel];
        if let Some(mode) = self.mode {
            payload.push(mode.as_byte());
            if let Some(binding) = self.binding {
                payload.extend_from_slice(&binding.offset.to_le_bytes());
                payload.push(binding.control);
                payload.push(binding.size);
            }
        }
        payload
    }
}

/// Global telemetry decimation factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimation(pub u8);

impl Decimation {
    pub const COMMAND: Command = Command::Decimation;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload.first() {
            Some(&value) => Ok(Self(value)),
            None => Err(ProtoError::TooShort {
                message: "decimation",
                need: 1,
                got: 0,
            }),
        }
    }

    pub fn to_payload(self) -> Vec<u8> {
        vec![self.0]
    }
}

/// One telemetry sample batch: a 24-bit timestamp, the bitmask of
/// channels present and their value bytes packed back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub timestamp: u32,
    pub mask: u16,
    pub values: Bytes,
}

impl ChannelData {
    pub const COMMAND: Command = Command::ReadChannelData;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(ProtoError::TooShort {
                message: "channel data",
                need: 5,
                got: payload.len(),
            });
        }
        let timestamp =
            u32::from(payload[0]) | u32::from(payload[1]) << 8 | u32::from(payload[2]) << 16;
        let mask = u16::from_le_bytes([payload[3], payload[4]]);
        Ok(Self {
            timestamp,
            mask,
            values: Bytes::copy_from_slice(&payload[5..]),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5 + self.values.len());
        payload.push(self.timestamp as u8);
        payload.push((self.timestamp >> 8) as u8);
        payload.push((self.timestamp >> 16) as u8);
        payload.extend_from_slice(&self.mask.to_le_bytes());
        payload.extend_from_slice(&self.values);
        payload
    }
}

/// Free-form text a node pushes to its terminal stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugString(pub String);

impl DebugString {
    pub const COMMAND: Command = Command::DebugString;

    pub fn from_payload(payload: &[u8]) -> Self {
        Self(String::from_utf8_lossy(payload).into_owned())
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

/// Structured trace record: severity byte followed by UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub level: TraceLevel,
    pub text: String,
}

impl TraceEvent {
    pub const COMMAND: Command = Command::Tracing;

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(ProtoError::TooShort {
                message: "trace",
                need: 2,
                got: payload.len(),
            });
        }
        Ok(Self {
            level: TraceLevel::from_byte(payload[0]),
            text: String::from_utf8_lossy(&payload[1..]).into_owned(),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.level as u8];
        payload.extend_from_slice(self.text.as_bytes());
        payload
    }
}
