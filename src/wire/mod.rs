//! Wire framing: the BEP-3 handshake and the length-prefixed peer message
//! stream that follows it.
pub mod handshake;
pub mod message;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("read timed out")]
    ReadTimeout,

    #[error("invalid protocol identifier")]
    InvalidProtocol,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("connection closed mid-frame")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

pub type WireResult<T> = std::result::Result<T, WireError>;
