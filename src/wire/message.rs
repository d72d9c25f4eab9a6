//! Peer message framing: the `<len><id><payload>` stream that follows the
//! handshake. `length == 0` is a keep-alive; otherwise the first
//! payload byte is the message id.
use super::{WireError, WireResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const BLOCK_MAX: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> WireResult<Self> {
        match id {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            other => Err(WireError::MalformedMessage(format!("unknown message id {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        Message::Request { index, begin, length }
    }

    fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
        }
    }

    /// Serializes the message to its wire form: 4-byte big-endian length
    /// prefix, one id byte, then the typed payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => {
                payload.extend_from_slice(&piece_index.to_be_bytes());
            }
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
        }

        let mut out = Vec::with_capacity(4 + 1 + payload.len());
        let length = (1 + payload.len()) as u32;
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, length);
        out.extend_from_slice(&len_buf);
        out.push(self.id() as u8);
        out.extend_from_slice(&payload);
        out
    }

    fn from_wire(id: MessageId, payload: Bytes) -> WireResult<Message> {
        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(WireError::MalformedMessage("have payload != 4 bytes".into()));
                }
                Message::Have { piece_index: BigEndian::read_u32(&payload) }
            }
            MessageId::Bitfield => Message::Bitfield(payload),
            MessageId::Request | MessageId::Cancel => {
                if payload.len() != 12 {
                    return Err(WireError::MalformedMessage(
                        "request/cancel payload != 12 bytes".into(),
                    ));
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(WireError::MalformedMessage("piece payload too short".into()));
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                Message::Piece { index, begin, block: payload.slice(8..) }
            }
        })
    }

    /// Writes this message to `stream`.
    pub async fn write(&self, stream: &mut TcpStream) -> WireResult<()> {
        stream.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Reads one frame off `stream` within `read_deadline`. `Ok(None)`
    /// means a keep-alive (`length == 0`), not end-of-stream.
    pub async fn read(stream: &mut TcpStream, read_deadline: Duration) -> WireResult<Option<Message>> {
        let mut len_buf = [0u8; 4];
        timeout(read_deadline, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| WireError::ReadTimeout)??;
        let length = BigEndian::read_u32(&len_buf);
        if length == 0 {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(length as usize);
        timeout(read_deadline, stream.read_exact(&mut buf))
            .await
            .map_err(|_| WireError::ReadTimeout)?
            .map_err(|_| WireError::ConnectionClosed)?;

        let id = MessageId::from_u8(buf[0])?;
        let payload = buf.freeze().slice(1..);
        Message::from_wire(id, payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_to_the_exact_scenario_e_bytes() {
        let msg = Message::request(1, 2, 3);
        let bytes = msg.encode();
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x00, 0x0d, 0x06, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03]
        );
    }

    #[test]
    fn have_round_trips_through_wire_form() {
        let msg = Message::Have { piece_index: 7 };
        let encoded = msg.encode();
        assert_eq!(BigEndian::read_u32(&encoded[0..4]), 5);
        assert_eq!(encoded[4], MessageId::Have as u8);
        assert_eq!(BigEndian::read_u32(&encoded[5..9]), 7);
    }
}
