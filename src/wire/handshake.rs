//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use super::{WireError, WireResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID. */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *PROTOCOL,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into the 68-byte wire form. */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a 68-byte handshake off `stream`, applying
    /// `read_deadline` to the whole read.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream, read_deadline: Duration) -> WireResult<Self> {
        let mut buf = [0u8; 68];
        timeout(read_deadline, stream.read_exact(&mut buf))
            .await
            .map_err(|_| WireError::ReadTimeout)??;

        let protocol_len = buf[0];
        if protocol_len != 19 {
            return Err(WireError::InvalidProtocol);
        }

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[1..20]);
        if &protocol != PROTOCOL {
            return Err(WireError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { protocol_len, protocol, reserved, info_hash, peer_id })
    }

    /// Writes the serialized handshake to `stream`.
    #[instrument(level = "trace", skip(stream))]
    pub async fn write(&self, stream: &mut TcpStream) -> WireResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    /** Validates this handshake's info hash against the expected value.
    A peer-id mismatch is *not* an error in the absence of prior
    knowledge of the peer's id — only the info hash is load-bearing here. */
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> WireResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(WireError::InfoHashMismatch);
        }
        Ok(())
    }

    /// Dials `addr` with a connect timeout, then performs the handshake:
    /// write ours, read and validate theirs. Returns the open connection
    /// and the peer's handshake.
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn connect_and_handshake(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> WireResult<(TcpStream, Handshake)> {
        let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::ConnectTimeout)??;

        let ours = Handshake::new(info_hash, peer_id);
        ours.write(&mut stream).await?;

        let theirs = Handshake::read(&mut stream, read_timeout).await?;
        theirs.validate(info_hash)?;

        Ok((stream, theirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_the_exact_68_byte_wire_form() {
        let peer_id: [u8; 20] = *b"12345678901234567890";
        let info_hash_vec = hex::decode("9e638562ab1c1fced9def142864cdd5a7019e1aa").unwrap();
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&info_hash_vec);

        let hs = Handshake::new(info_hash, peer_id);
        let bytes = hs.serialize();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);
    }

    #[test]
    fn rejects_info_hash_mismatch() {
        let hs = Handshake::new([1u8; 20], [0u8; 20]);
        assert!(hs.validate([2u8; 20]).is_err());
        assert!(hs.validate([1u8; 20]).is_ok());
    }
}
