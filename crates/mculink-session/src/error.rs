use thiserror::Error;

use mculink_proto::{Direction, ProtoError};
use mculink_transport::TransportError;

/// Errors surfaced by the outbound session API. Inbound traffic never
/// produces these; bad frames and failed dispatches become diagnostics on
/// the message instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("frame: {0}")]
    Frame(#[from] mculink_frame::FrameError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("no node with id 0x{0:02X}")]
    UnknownNode(u8),

    #[error("no register at offset 0x{offset:08X} with direction {direction:?} on node 0x{node_id:02X}")]
    UnknownRegister {
        node_id: u8,
        offset: u32,
        direction: Direction,
    },

    #[error("no free channel slot on node 0x{0:02X}")]
    NoFreeChannel(u8),

    #[error("channel {channel} on node 0x{node_id:02X} is not bound")]
    ChannelNotBound { node_id: u8, channel: u8 },

    #[error("session is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, SessionError>;
