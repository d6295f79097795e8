//! Host-side toolkit for an escaped-framing debug protocol.
//!
//! mculink talks a byte-oriented wire protocol to microcontroller nodes:
//! STX/ETX framing with escape stuffing and a CRC trailer, typed request
//! and response commands, and streamed channel telemetry.
//!
//! # Crate Structure
//!
//! - [`transport`] — Byte links (TCP, in-memory pairs)
//! - [`frame`] — Framing, escaping and CRC validation
//! - [`proto`] — Typed commands, control bytes and register values
//! - [`session`] — Node discovery, acknowledgement tracking and telemetry
//!   (behind `session` feature)
//! - [`emulator`] — A software node for hosts under test (behind
//!   `emulator` feature)

/// Re-export transport types.
pub mod transport {
    pub use mculink_transport::*;
}

/// Re-export framing types.
pub mod frame {
    pub use mculink_frame::*;
}

/// Re-export protocol message types.
pub mod proto {
    pub use mculink_proto::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use mculink_session::*;
}

/// Re-export emulator types (requires `emulator` feature).
#[cfg(feature = "emulator")]
pub mod emulator {
    pub use mculink_emulator::*;
}
