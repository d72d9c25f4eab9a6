//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the swarm manager to discover peers for a torrent. Responses are
//! decoded through our own bencode schema (`bencode::schema`), never
//! `serde_bencode` — the crate has no serde dependency left to round-trip
//! through.
pub mod server;

use crate::bencode::schema::FromBencode;
use crate::bencode::{self, schema, BencodeError, BencodeValue};
use crate::torrent::file::TorrentFile;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

pub type InfoHash = [u8; 20];
pub type PeerId = [u8; 20];

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Represents a client communicating with a BitTorrent tracker.
#[derive(Debug)]
pub struct Client {
    peer_id: PeerId,
    port: u16,
    http: reqwest::Client,
}

/// Contains the parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub left: i64,
}

/// A peer as returned by a tracker. `peer_id` is only ever populated by the
/// non-compact response form — compact peers are address-only by design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: Option<PeerId>,
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response from a tracker announce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub complete: i64,
    pub incomplete: i64,
    pub peers: Vec<Peer>,
}

impl Client {
    pub fn new(port: u16) -> TrackerResult<Self> {
        Ok(Self {
            peer_id: generate_peer_id(),
            port,
            http: reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sends an announce request to the tracker to get a list of peers.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &TorrentFile) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: torrent.total_length(),
        };

        // Built by hand rather than through `Url::query_pairs_mut`: that
        // encoder would re-escape the `%XX` sequences `url_encode` already
        // produced for the raw info_hash/peer_id bytes.
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.compact as i32,
        );
        let mut url = url::Url::parse(&torrent.announce)?;
        url.set_query(Some(&query));
        tracing::debug!(%url, "making announce request to tracker");

        let response = self.http.get(url).send().await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses the bencoded body of a tracker announce response, handling
    /// both the compact (6-byte packed IPv4+port) and non-compact
    /// (dictionary-per-peer) peer list forms.
    ///
    /// The `failure reason` check happens ahead of the typed projection
    /// rather than as a field on `AnnounceResponse` itself, since a
    /// failure body and a success body are mutually exclusive shapes, not
    /// a record with an optional field.
    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let value = bencode::decoder::decode(bytes)?;
        let dict = schema::dict_of(&value)?;

        if let Ok(reason) = schema::require_string(dict, b"failure reason") {
            return Err(TrackerError::Failure(reason));
        }

        schema::project::<AnnounceResponse>(&value).map_err(TrackerError::Bencode)
    }
}

impl FromBencode for Peer {
    /// Only ever invoked for the non-compact peer-list form; the compact
    /// 6-byte-per-peer form is unpacked directly in
    /// `AnnounceResponse::from_bencode` since it isn't itself a bencode
    /// dictionary.
    fn from_bencode(value: &BencodeValue) -> bencode::BencodeResult<Self> {
        let dict = schema::dict_of(value)?;
        let ip_str = schema::require_string(dict, b"ip")?;
        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|e| BencodeError::SchemaViolation(format!("peer ip {ip_str:?} invalid: {e}")))?;
        let port = schema::require_integer(dict, b"port")? as u16;
        let peer_id = schema::get_field(dict, b"peer id", |v| v.as_bytes().map(|b| b.to_vec()))?
            .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok());
        Ok(Peer { peer_id, ip, port })
    }
}

impl FromBencode for AnnounceResponse {
    fn from_bencode(value: &BencodeValue) -> bencode::BencodeResult<Self> {
        let dict = schema::dict_of(value)?;
        let interval = schema::integer_or_default(dict, b"interval")?;
        let complete = schema::integer_or_default(dict, b"complete")?;
        let incomplete = schema::integer_or_default(dict, b"incomplete")?;

        let peers = match dict.get(b"peers".as_slice()) {
            Some(BencodeValue::String(bytes)) => bytes
                .chunks_exact(6)
                .map(|chunk| Peer {
                    peer_id: None,
                    ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect(),
            Some(BencodeValue::List(entries)) => {
                entries.iter().filter_map(|entry| Peer::from_bencode(entry).ok()).collect()
            }
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, complete, incomplete, peers })
    }
}

/// Generates a unique peer ID for this client: a 9-byte client prefix
/// (`-RT0001-`, RT = Rust torrent) followed by 11 random bytes.
fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes a byte slice: unreserved characters (`a-z`,
/// `A-Z`, `0-9`, `-`, `.`, `_`, `~`) pass through; everything else becomes
/// `%XX` with an uppercase hex pair.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_matches_scenario_g() {
        let bytes = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf1, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
            0xef, 0x12, 0x34, 0x56, 0x78, 0x9a,
        ];
        assert_eq!(url_encode(&bytes), "%124Vx%9A%BC%DE%F1%23Eg%89%AB%CD%EF%124Vx%9A");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut dict = std::collections::HashMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        dict.insert(
            b"peers".to_vec(),
            BencodeValue::String(vec![127, 0, 0, 1, 0x1a, 0xe1]),
        );
        let encoded = bencode::encoder::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        let response = Client::parse_announce_response(&encoded).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(response.peers[0].port, 0x1ae1);
    }

    #[test]
    fn surfaces_failure_reason() {
        let mut dict = std::collections::HashMap::new();
        dict.insert(b"failure reason".to_vec(), BencodeValue::String(b"unknown info hash".to_vec()));
        let encoded = bencode::encoder::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        let err = Client::parse_announce_response(&encoded).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }
}
