//! Per-peer session state machines.
pub mod session;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
