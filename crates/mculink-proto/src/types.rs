use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Variable type tag attached to every register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum VariableType {
    MemoryAlignment = 0x00,
    Pointer = 0x01,
    Bool = 0x02,
    Char = 0x03,
    Short = 0x04,
    Int = 0x05,
    Long = 0x06,
    Float = 0x07,
    Double = 0x08,
    LongDouble = 0x09,
    TimeStamp = 0x0A,
    SChar = 0x0B,
    UChar = 0x0C,
    UShort = 0x0D,
    UInt = 0x0E,
    ULong = 0x0F,
    String = 0x10,
    Blob = 0x11,
    Unknown = 0xFF,
}

impl VariableType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => VariableType::MemoryAlignment,
            0x01 => VariableType::Pointer,
            0x02 => VariableType::Bool,
            0x03 => VariableType::Char,
            0x04 => VariableType::Short,
            0x05 => VariableType::Int,
            0x06 => VariableType::Long,
            0x07 => VariableType::Float,
            0x08 => VariableType::Double,
            0x09 => VariableType::LongDouble,
            0x0A => VariableType::TimeStamp,
            0x0B => VariableType::SChar,
            0x0C => VariableType::UChar,
            0x0D => VariableType::UShort,
            0x0E => VariableType::UInt,
            0x0F => VariableType::ULong,
            0x10 => VariableType::String,
            0x11 => VariableType::Blob,
            _ => VariableType::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Size table a node starts out with, before its info response overrides
/// individual entries. `String` and `Blob` are variable length (0). The
/// `TimeStamp` entry is not a byte count but the timestamp unit in
/// microseconds.
pub fn default_sizes() -> HashMap<VariableType, u32> {
    HashMap::from([
        (VariableType::MemoryAlignment, 1),
        (VariableType::Pointer, 4),
        (VariableType::Char, 1),
        (VariableType::Short, 2),
        (VariableType::Int, 4),
        (VariableType::Long, 8),
        (VariableType::Float, 4),
        (VariableType::Double, 8),
        (VariableType::LongDouble, 8),
        (VariableType::SChar, 1),
        (VariableType::UChar, 1),
        (VariableType::UShort, 2),
        (VariableType::UInt, 4),
        (VariableType::ULong, 8),
        (VariableType::String, 0),
        (VariableType::Blob, 0),
        (VariableType::TimeStamp, 1000),
    ])
}

/// Debug channel update mode. `Off` releases the channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ChannelMode {
    Off = 0x00,
    OnChange = 0x01,
    LowSpeed = 0x02,
    Once = 0x03,
}

impl ChannelMode {
    pub fn from_byte(byte: u8) -> crate::error::Result<Self> {
        match byte {
            0x00 => Ok(ChannelMode::Off),
            0x01 => Ok(ChannelMode::OnChange),
            0x02 => Ok(ChannelMode::LowSpeed),
            0x03 => Ok(ChannelMode::Once),
            other => Err(crate::error::ProtoError::UnknownChannelMode(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Severity of a trace message emitted by a node. Out-of-range bytes fall
/// back to `Trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum TraceLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Fatal = 5,
}

impl TraceLevel {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => TraceLevel::Debug,
            2 => TraceLevel::Info,
            3 => TraceLevel::Warning,
            4 => TraceLevel::Error,
            5 => TraceLevel::Fatal,
            _ => TraceLevel::Trace,
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TraceLevel::Trace => "trace",
            TraceLevel::Debug => "debug",
            TraceLevel::Info => "info",
            TraceLevel::Warning => "warning",
            TraceLevel::Error => "error",
            TraceLevel::Fatal => "fatal",
        };
        f.write_str(label)
    }
}
