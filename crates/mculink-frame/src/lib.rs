//! Self-synchronizing framing for the mculink debug wire protocol.
//!
//! Every message travels as an `STX … ETX` delimited frame:
//! - reserved bytes inside the frame are escaped as `ESC, ESC ^ byte`, so
//!   the delimiters never appear bare mid-stream
//! - an 8-bit CRC over controller id, msg id, command and payload guards
//!   against corruption
//! - the decoder carries a remainder across reads, so frames may be split
//!   across chunks or packed several to a chunk
//!
//! Malformed inbound frames decode to [`ProtocolMessage`] values with
//! `invalid_reason` set instead of disappearing; the session engine counts
//! them per node.

pub mod codec;
pub mod command;
pub mod crc;
pub mod error;
pub mod message;

pub use codec::{
    calculate_crc, decode_messages, encode_message, BROADCAST_ID, ESC, ETX, MIN_FRAME_LEN, STX,
};
pub use command::Command;
pub use crc::{crc8, crc8_update};
pub use error::{FrameError, Result};
pub use message::ProtocolMessage;
