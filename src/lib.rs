//! Library root for rs-torrent-client.
//!
//! Re-exports core modules for use in binaries and other libraries.
pub mod bencode;
pub mod bitfield;
pub mod cli;
pub mod config;
pub mod peer;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod wire;
