//! Error types for the RTP-MIDI session service

use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer is shorter than the structure being decoded
    #[error("Need more data: {needed} bytes required, {available} available")]
    NeedMoreData { needed: usize, available: usize },

    #[error("Bad command signature: {0:#06x}")]
    BadSignature(u16),

    #[error("Unknown command tag: {0:#06x}")]
    UnknownCommand(u16),

    #[error("Invalid sync count: {0}")]
    InvalidSyncCount(u8),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Outbound datagram would not fit in a single UDP packet
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("MIDI payload too long: {0} bytes")]
    PayloadTooLong(usize),
}

impl CodecError {
    /// True when the input was simply truncated
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::NeedMoreData { .. })
    }
}

/// Session registry and protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session for ssrc {0:#010x}")]
    NoSession(u32),

    #[error("No session for initiator token {0:#010x}")]
    UnknownInitiator(u32),

    #[error("Session already registered for ssrc {0:#010x}")]
    DuplicateSsrc(u32),

    #[error("Maximum sessions reached: {0}")]
    RegistryFull(usize),

    #[error("Session handle is stale")]
    StaleHandle,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Work queue is shut down")]
    QueueClosed,
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, Error>;
