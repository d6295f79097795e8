//! Typed layer of the debug protocol: firmware versions, control bytes,
//! variable types and the application messages exchanged over validated
//! frames.
//!
//! Everything here is payload-shaped. Framing, escaping and CRC live in
//! `mculink-frame`; session behavior (acknowledgements, retransmission,
//! node bookkeeping) lives in `mculink-session`.

mod control;
mod error;
mod info;
mod messages;
mod types;
mod value;
mod version;

pub use control::{Control, Direction, ValueSource};
pub use error::{ProtoError, Result};
pub use info::{encode_size_records, parse_size_records, SizeRecord, RECORD_SEPARATOR};
pub use messages::{
    ChannelBinding, ChannelData, ConfigChannel, DebugString, Decimation, QueryRegister,
    TraceEvent, VersionInfo, WriteRegister,
};
pub use types::{default_sizes, ChannelMode, TraceLevel, VariableType};
pub use value::RegisterValue;
pub use version::FirmwareVersion;
