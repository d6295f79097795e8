use std::sync::mpsc;
use std::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::link::{ChunkReceiver, Link};

/// One endpoint of an in-process link pair.
///
/// Everything transmitted on one endpoint arrives as a single chunk on the
/// other endpoint's receiver. Used by tests and by the emulator when both
/// sides live in the same process.
pub struct MemoryLink {
    tx: Mutex<mpsc::Sender<Vec<u8>>>,
    label: &'static str,
}

impl MemoryLink {
    /// Create a connected pair of endpoints.
    pub fn pair() -> ((MemoryLink, ChunkReceiver), (MemoryLink, ChunkReceiver)) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            (
                MemoryLink {
                    tx: Mutex::new(a_tx),
                    label: "mem:a",
                },
                a_rx,
            ),
            (
                MemoryLink {
                    tx: Mutex::new(b_tx),
                    label: "mem:b",
                },
                b_rx,
            ),
        )
    }
}

impl Link for MemoryLink {
    fn transmit(&self, buf: &[u8]) -> Result<()> {
        let tx = self.tx.lock().map_err(|_| TransportError::Closed)?;
        tx.send(buf.to_vec()).map_err(|_| TransportError::Closed)
    }

    fn peer_label(&self) -> String {
        self.label.to_string()
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("label", &self.label)
            .finish()
    }
}
