/// Command byte of a protocol message.
///
/// These values are fixed wire constants; an unrecognized command byte makes
/// the whole frame invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    GetVersion = 0x56,
    GetInfo = 0x49,
    WriteRegister = 0x57,
    QueryRegister = 0x51,
    ConfigChannel = 0x43,
    Decimation = 0x44,
    ResetTime = 0x54,
    ReadChannelData = 0x52,
    DebugString = 0x53,
    EmbeddedConfiguration = 0x45,
    Tracing = 0x41,
}

impl Command {
    /// Decode a command byte, `None` for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x56 => Command::GetVersion,
            0x49 => Command::GetInfo,
            0x57 => Command::WriteRegister,
            0x51 => Command::QueryRegister,
            0x43 => Command::ConfigChannel,
            0x44 => Command::Decimation,
            0x54 => Command::ResetTime,
            0x52 => Command::ReadChannelData,
            0x53 => Command::DebugString,
            0x45 => Command::EmbeddedConfiguration,
            0x41 => Command::Tracing,
            _ => return None,
        })
    }

    /// The wire byte for this command.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::GetVersion => "GetVersion",
            Command::GetInfo => "GetInfo",
            Command::WriteRegister => "WriteRegister",
            Command::QueryRegister => "QueryRegister",
            Command::ConfigChannel => "ConfigChannel",
            Command::Decimation => "Decimation",
            Command::ResetTime => "ResetTime",
            Command::ReadChannelData => "ReadChannelData",
            Command::DebugString => "DebugString",
            Command::EmbeddedConfiguration => "EmbeddedConfiguration",
            Command::Tracing => "Tracing",
        };
        f.write_str(name)
    }
}
