/// Errors that can occur when encoding frames.
///
/// Decoding never fails with an error: malformed inbound frames become
/// messages with `invalid_reason` set, so they stay countable.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message carries no command and cannot be put on the wire.
    #[error("cannot encode a message without a command")]
    MissingCommand,
}

pub type Result<T> = std::result::Result<T, FrameError>;
