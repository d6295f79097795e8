use std::sync::mpsc;

use crate::error::Result;

/// The outbound half of a byte transport.
///
/// The engine hands a complete encoded frame to [`Link::transmit`] and the
/// implementation writes it out atomically (no interleaving with other
/// writers). Implementations make no promise about chunk boundaries on the
/// receive side — inbound bytes arrive as arbitrary-sized chunks on the
/// channel returned when the link was created.
pub trait Link: Send + Sync {
    /// Transmit a raw buffer to the peer.
    fn transmit(&self, buf: &[u8]) -> Result<()>;

    /// Human-readable description of the remote endpoint, for logging.
    fn peer_label(&self) -> String;
}

/// Receiving side of a link: arbitrary-sized raw byte chunks.
///
/// The sender half is owned by the transport's reader thread; when the
/// underlying connection closes, the sender is dropped and the receiver
/// starts returning `Err(RecvTimeoutError::Disconnected)`, which consumers
/// treat as the disconnect lifecycle event.
pub type ChunkReceiver = mpsc::Receiver<Vec<u8>>;
