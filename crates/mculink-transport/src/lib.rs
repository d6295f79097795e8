//! Byte-chunk transport boundary for the mculink debug wire engine.
//!
//! The engine never talks to a socket or serial port directly; it requires
//! only a [`Link`] that transmits raw buffers and a [`ChunkReceiver`] that
//! delivers inbound bytes in arbitrary-sized chunks. Chunk boundaries carry
//! no meaning — frames may span chunks and chunks may contain several
//! frames.
//!
//! Two concrete links ship here: [`TcpLink`] for network-attached targets
//! and [`MemoryLink`] for in-process wiring (tests, emulator). Serial links
//! and other integrations implement [`Link`] in the host application.

pub mod error;
pub mod link;
pub mod mem;
pub mod tcp;

pub use error::{Result, TransportError};
pub use link::{ChunkReceiver, Link};
pub use mem::MemoryLink;
pub use tcp::{TcpLink, TcpServer};
