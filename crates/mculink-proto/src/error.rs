use thiserror::Error;

use crate::version::FirmwareVersion;

/// Errors raised while constructing typed messages or packing control bytes.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload shorter than the fixed part of the message layout.
    #[error("{message} payload too short: need {need} bytes, got {got}")]
    TooShort {
        message: &'static str,
        need: usize,
        got: usize,
    },

    /// Trailing value bytes disagree with the size field in front of them.
    #[error("value length {got} does not match declared size {declared}")]
    ValueSizeMismatch { declared: usize, got: usize },

    /// No control byte layout is defined for this protocol version. Refuse
    /// rather than guess an offset map for firmware we do not know.
    #[error("protocol version {0} has no defined control byte layout")]
    UnsupportedVersion(FirmwareVersion),

    /// The direction bits of a control byte are zero.
    #[error("control byte 0x{0:02X} encodes no access direction")]
    MalformedControl(u8),

    #[error("unknown channel mode 0x{0:02X}")]
    UnknownChannelMode(u8),

    /// A size record in a target info payload is cut short.
    #[error("malformed size record in target info payload")]
    MalformedSizeRecord,
}

pub type Result<T> = std::result::Result<T, ProtoError>;
