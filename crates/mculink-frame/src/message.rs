use bytes::Bytes;

use crate::command::Command;

/// An in-memory protocol message: the transport-level envelope shared by
/// every command.
///
/// A message comes from one of two places: built locally for an outbound
/// send (the session engine assigns `msg_id`), or decoded from an inbound
/// frame. Decode failures still produce a message, with `invalid_reason`
/// set, so malformed traffic remains countable instead of vanishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub controller_id: u8,
    pub msg_id: u8,
    /// `None` only on messages that failed to decode.
    pub command: Option<Command>,
    pub payload: Bytes,
    pub invalid_reason: Option<String>,
    /// Set by the session engine when this inbound message matched a
    /// pending outbound message.
    pub is_ack: bool,
}

impl ProtocolMessage {
    /// Build an outbound message.
    pub fn new(controller_id: u8, msg_id: u8, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            controller_id,
            msg_id,
            command: Some(command),
            payload: payload.into(),
            invalid_reason: None,
            is_ack: false,
        }
    }

    /// Build the record of a frame that failed validation.
    pub fn invalid(reason: impl Into<String>, controller_id: u8) -> Self {
        Self {
            controller_id,
            msg_id: 0,
            command: None,
            payload: Bytes::new(),
            invalid_reason: Some(reason.into()),
            is_ack: false,
        }
    }

    /// Whether this message passed framing validation.
    ///
    /// An ACK match overrides a dispatch diagnostic: the peer answered,
    /// even if we could not make sense of the answer's payload.
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none() || self.is_ack
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.command {
            Some(cmd) => write!(
                f,
                "uc[{:#04x}] msg[{:#04x}] {} ({} bytes)",
                self.controller_id,
                self.msg_id,
                cmd,
                self.payload.len()
            )?,
            None => write!(f, "uc[{:#04x}] <no command>", self.controller_id)?,
        }
        if let Some(reason) = &self.invalid_reason {
            write!(f, " invalid: {reason}")?;
        }
        Ok(())
    }
}
