//! Session engine for the debug protocol.
//!
//! Sits between the frame codec and the host application: discovers
//! nodes, correlates acknowledgements, retransmits unanswered requests,
//! and applies inbound telemetry to per-node register and channel state.
//! Host applications consume state through snapshots and a subscription
//! stream of [`Notification`] events.

mod engine;
mod error;
mod node;
mod notify;

pub use engine::{Session, ACK_TIMEOUT_TICKS, RESEND_TICK};
pub use error::{Result, SessionError};
pub use node::{ChannelTable, CpuNode, NodeSnapshot, Register, RegisterMap, MAX_CHANNELS};
pub use notify::Notification;
