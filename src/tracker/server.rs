//! The companion tracker HTTP service: a bencoded BEP-3 announce
//! endpoint plus an in-memory per-torrent peer registry with periodic
//! stale-peer eviction. State lives behind a `store`/`last_seen` pair of
//! mutexes; torrents are seeded from a directory scan at startup and
//! peers are swept out on a periodic `interval`.
use crate::bencode::schema::ToBencode;
use crate::bencode::{encoder, schema, BencodeValue};
use crate::torrent::file::TorrentFile;
use crate::tracker::{AnnounceResponse, InfoHash, Peer, PeerId};
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct TrackerState {
    interval: Duration,
    store: Mutex<HashMap<InfoHash, AnnounceResponse>>,
    last_seen: Mutex<HashMap<InfoHash, HashMap<PeerId, Instant>>>,
}

impl TrackerState {
    pub fn new(interval: Duration) -> Self {
        Self { interval, store: Mutex::new(HashMap::new()), last_seen: Mutex::new(HashMap::new()) }
    }

    fn seed(&self, info_hash: InfoHash) {
        self.store.lock().unwrap().entry(info_hash).or_insert_with(|| AnnounceResponse {
            interval: self.interval.as_secs() as i64,
            complete: 0,
            incomplete: 0,
            peers: Vec::new(),
        });
        self.last_seen.lock().unwrap().entry(info_hash).or_default();
    }
}

/// Scans `dir` for `*.torrent` files, parses each, and seeds an empty
/// response for its info-hash.
pub fn load_torrents_dir(dir: &Path, state: &TrackerState) -> std::io::Result<usize> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("torrent") {
            continue;
        }
        match TorrentFile::parse_file(&path) {
            Ok(torrent) => {
                state.seed(torrent.info_hash);
                loaded += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparsable torrent file"),
        }
    }
    Ok(loaded)
}

pub fn router(state: std::sync::Arc<TrackerState>) -> Router {
    Router::new().route("/announce", get(announce)).with_state(state)
}

/// Runs the eviction sweep: every `state.interval`, drops peers whose
/// `last_seen` is older than `now - interval`, from both `last_seen` and
/// the corresponding response's `peers[]`.
pub async fn run_eviction_loop(state: std::sync::Arc<TrackerState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(state.interval) => {}
        }

        let now = Instant::now();
        let mut last_seen = state.last_seen.lock().unwrap();
        let mut store = state.store.lock().unwrap();
        for (info_hash, peers) in last_seen.iter_mut() {
            let stale: Vec<PeerId> = peers
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > state.interval)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            if !stale.is_empty() {
                if let Some(response) = store.get_mut(info_hash) {
                    response.peers.retain(|p| p.peer_id.map(|id| !stale.contains(&id)).unwrap_or(true));
                }
                info!(evicted = stale.len(), info_hash = %hex::encode(info_hash), "evicted stale peers");
            }
        }
    }
}

async fn announce(
    State(state): State<std::sync::Arc<TrackerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
) -> Response {
    let params = parse_query(uri.query().unwrap_or(""));

    let Some(info_hash) = params.get("info_hash".as_bytes()).and_then(|v| <[u8; 20]>::try_from(v.clone()).ok())
    else {
        return failure("missing or malformed info_hash");
    };

    let mut store = state.store.lock().unwrap();
    let Some(response) = store.get_mut(&info_hash) else {
        return failure("unknown info hash");
    };

    if params.contains_key("quiet".as_bytes()) {
        let body = encoder::encode_to_vec(&encode_response(response)).unwrap_or_default();
        return body.into_response();
    }

    let Some(peer_id) = params.get("peer_id".as_bytes()).and_then(|v| <[u8; 20]>::try_from(v.clone()).ok())
    else {
        return failure("peer_id must be exactly 20 bytes");
    };

    let Some(port) = params
        .get("port".as_bytes())
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|p| *p >= 1)
    else {
        return failure("port must parse as 1..=65535");
    };

    let ip = remote.ip();
    if let Some(existing) = response.peers.iter_mut().find(|p| p.peer_id == Some(peer_id)) {
        existing.ip = ip;
        existing.port = port;
    } else {
        response.peers.push(Peer { peer_id: Some(peer_id), ip, port });
    }
    drop(store);

    state
        .last_seen
        .lock()
        .unwrap()
        .entry(info_hash)
        .or_default()
        .insert(peer_id, Instant::now());

    let store = state.store.lock().unwrap();
    let response = store.get(&info_hash).expect("just inserted above");
    let body = encoder::encode_to_vec(&encode_response(response)).unwrap_or_default();
    body.into_response()
}

fn failure(reason: &str) -> Response {
    let mut dict = HashMap::new();
    dict.insert(b"failure reason".to_vec(), BencodeValue::String(reason.as_bytes().to_vec()));
    let body = encoder::encode_to_vec(&BencodeValue::Dict(dict)).unwrap_or_default();
    (StatusCode::OK, body).into_response()
}

impl ToBencode for Peer {
    fn to_bencode(&self) -> BencodeValue {
        let mut dict = HashMap::new();
        if let Some(id) = self.peer_id {
            dict.insert(b"peer id".to_vec(), BencodeValue::String(id.to_vec()));
        }
        dict.insert(b"ip".to_vec(), BencodeValue::String(self.ip.to_string().into_bytes()));
        dict.insert(b"port".to_vec(), BencodeValue::Integer(self.port as i64));
        BencodeValue::Dict(dict)
    }
}

impl ToBencode for AnnounceResponse {
    fn to_bencode(&self) -> BencodeValue {
        let mut dict = HashMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(self.interval));
        dict.insert(b"complete".to_vec(), BencodeValue::Integer(self.complete));
        dict.insert(b"incomplete".to_vec(), BencodeValue::Integer(self.incomplete));
        let peers = self.peers.iter().map(Peer::to_bencode).collect();
        dict.insert(b"peers".to_vec(), BencodeValue::List(peers));
        BencodeValue::Dict(dict)
    }
}

fn encode_response(response: &AnnounceResponse) -> BencodeValue {
    schema::reflect(response)
}

/// Parses a raw query string into percent-decoded byte values, keyed by
/// raw (non-decoded) ASCII parameter name. `info_hash`/`peer_id` are raw
/// 20-byte values under percent-encoding, so this deliberately avoids any
/// UTF-8-validating query parser.
fn parse_query(raw: &str) -> HashMap<Vec<u8>, Vec<u8>> {
    let mut out = HashMap::new();
    for pair in raw.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        out.insert(percent_decode(key), percent_decode(value));
    }
    out
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_round_trips_raw_bytes() {
        let raw = [0x9au8, 0xbc, 0x23, b'A'];
        let encoded: String = raw
            .iter()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => (*b as char).to_string(),
                other => format!("%{:02X}", other),
            })
            .collect();
        assert_eq!(percent_decode(&encoded), raw.to_vec());
    }

    #[test]
    fn parse_query_splits_pairs_and_decodes_values() {
        let parsed = parse_query("peer_id=%41%42&port=6881&quiet=");
        assert_eq!(parsed.get(b"peer_id".as_slice()), Some(&b"AB".to_vec()));
        assert_eq!(parsed.get(b"port".as_slice()), Some(&b"6881".to_vec()));
        assert!(parsed.contains_key(b"quiet".as_slice()));
    }
}
