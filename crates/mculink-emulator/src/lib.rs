//! A software device for exercising hosts without hardware attached.
//!
//! [`Emulator`] binds a register table to a transport link, answers the
//! request commands a real node would, and streams channel telemetry on a
//! fixed tick. [`EmulatorConfig::demo`] provides a small node with waveform
//! and counter registers plus writable setpoints.

mod registers;
mod server;

pub use registers::{EmuRegister, EmulatorConfig, Waveform};
pub use server::{Emulator, EmulatorError, Result};
