//! Torrent file parsing and error handling logic.
//!
//! This module provides types and error handling for working with .torrent files, including parsing, validation, and error reporting.
use thiserror::Error;
pub mod file;
pub mod info_hash;
pub mod segment;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error(
        "piece count mismatch: ceil(total_length/piece_length)={expected} but len(pieces)/20={actual}"
    )]
    PieceCountMismatch { expected: usize, actual: usize },

    #[error("Date parse error")]
    DateParseError,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
