//! `SwarmManager`: owns the peer pool, drives tracker polling, and runs
//! the per-tick pool maintenance / piece selection / verification
//! pipeline.
use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::peer::session::{self, PeerHandle, PeerState};
use crate::torrent::file::TorrentFile;
use crate::torrent::segment;
use crate::tracker::{AnnounceResponse, Client as TrackerClient, InfoHash, PeerId};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::score;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_READ_TIMEOUT: Duration = Duration::from_secs(120);

fn is_unchoked(state: PeerState) -> bool {
    matches!(state, PeerState::Unchoked | PeerState::RequestingPiece | PeerState::PieceComplete)
}

struct SwarmState {
    peers: HashMap<SocketAddr, PeerHandle>,
    /// Which piece index each `RequestingPiece` peer is currently fetching
    /// — tracked here rather than inside the session, since the manager
    /// is the one that made the assignment.
    assignments: HashMap<SocketAddr, usize>,
    bitfield: Bitfield,
    last_announce: Option<AnnounceResponse>,
}

pub struct SwarmManager {
    torrent: TorrentFile,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    config: Config,
    tracker: TrackerClient,
    state: Mutex<SwarmState>,
}

impl SwarmManager {
    pub fn new(torrent: TorrentFile, config: Config, tracker: TrackerClient) -> Self {
        let info_hash = torrent.info_hash;
        let local_peer_id = tracker.peer_id();
        let bitfield = Bitfield::new(torrent.num_pieces());
        Self {
            torrent,
            info_hash,
            local_peer_id,
            config,
            tracker,
            state: Mutex::new(SwarmState {
                peers: HashMap::new(),
                assignments: HashMap::new(),
                bitfield,
                last_announce: None,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().bitfield.is_complete()
    }

    /// Runs the tick loop and the tracker-poll loop concurrently until the
    /// local bitfield is complete or `cancel` fires; tears down any
    /// remaining peer sessions on the way out.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(self.tick_loop(cancel.clone()), self.poll_loop(cancel.clone()));

        let peers: Vec<PeerHandle> = {
            let mut state = self.state.lock().unwrap();
            state.peers.drain().map(|(_, h)| h).collect()
        };
        for peer in peers {
            peer.shutdown();
        }
    }

    async fn tick_loop(&self, cancel: CancellationToken) {
        loop {
            if self.is_complete() {
                info!("local bitfield complete, shutting down");
                cancel.cancel();
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick(&cancel).await;
                }
            }
        }
    }

    async fn poll_loop(&self, cancel: CancellationToken) {
        let mut interval = self.config.tracker_poll_interval;
        if let Some(observed) = self.poll_tracker().await {
            interval = observed;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Some(observed) = self.poll_tracker().await {
                        interval = observed;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn poll_tracker(&self) -> Option<Duration> {
        match self.tracker.announce(&self.torrent).await {
            Ok(response) => {
                let interval =
                    (response.interval > 0).then(|| Duration::from_secs(response.interval as u64));
                self.state.lock().unwrap().last_announce = Some(response);
                interval
            }
            Err(e) => {
                warn!(error = %e, "tracker poll failed, retrying next interval");
                None
            }
        }
    }

    async fn tick(&self, cancel: &CancellationToken) {
        self.evict_errored_peers();
        self.evict_low_score_peers();
        self.top_up_pool(cancel).await;
        self.handle_completions();
        self.select_pieces();
    }

    fn evict_errored_peers(&self) {
        let mut state = self.state.lock().unwrap();
        let dead: Vec<SocketAddr> = state
            .peers
            .iter()
            .filter(|(_, h)| h.state() == PeerState::Error || h.is_finished())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in dead {
            if let Some(handle) = state.peers.remove(&addr) {
                handle.shutdown();
            }
            state.assignments.remove(&addr);
        }
    }

    /// Ejects up to two peers whose score is `<= 1` (tie-break: iteration
    /// order, which is arbitrary for a `HashMap`).
    fn evict_low_score_peers(&self) {
        let mut state = self.state.lock().unwrap();
        let local = state.bitfield.clone();
        let snapshot: Vec<(SocketAddr, Bitfield, PeerState)> =
            state.peers.iter().map(|(addr, h)| (*addr, h.remote_bitfield(), h.state())).collect();
        let bitfield_refs: Vec<&Bitfield> = snapshot.iter().map(|(_, b, _)| b).collect();
        let avail = score::availability(&local, &bitfield_refs);
        let num_peers = snapshot.len();

        let mut low_score: Vec<SocketAddr> = snapshot
            .iter()
            .filter(|(_, bitfield, state)| {
                score::peer_score(bitfield, is_unchoked(*state), &local, &avail, num_peers) <= 1
            })
            .map(|(addr, _, _)| *addr)
            .collect();
        low_score.truncate(2);

        for addr in low_score {
            if let Some(handle) = state.peers.remove(&addr) {
                handle.shutdown();
            }
            state.assignments.remove(&addr);
        }
    }

    async fn top_up_pool(&self, cancel: &CancellationToken) {
        let candidates = {
            let state = self.state.lock().unwrap();
            if state.peers.len() >= self.config.pool_capacity {
                return;
            }
            match &state.last_announce {
                Some(response) => response.peers.clone(),
                None => return,
            }
        };

        for candidate in candidates {
            if self.state.lock().unwrap().peers.len() >= self.config.pool_capacity {
                break;
            }
            if candidate.peer_id == Some(self.local_peer_id) || candidate.port == self.config.listen_port {
                continue;
            }
            let addr = SocketAddr::new(candidate.ip, candidate.port);
            if self.state.lock().unwrap().peers.contains_key(&addr) {
                continue;
            }

            match session::spawn(
                addr,
                self.info_hash,
                self.local_peer_id,
                self.torrent.num_pieces(),
                CONNECT_TIMEOUT,
                HANDSHAKE_READ_TIMEOUT,
                MESSAGE_READ_TIMEOUT,
                cancel.child_token(),
            )
            .await
            {
                Ok(handle) => {
                    info!(%addr, "connected to peer");
                    self.state.lock().unwrap().peers.insert(addr, handle);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "peer connect/handshake failed");
                }
            }
        }
    }

    /// For every piece we need that nobody is currently fetching, assigns
    /// it to any peer sitting in `Unchoked` (idle — not already requesting
    /// or awaiting verification) that has it. At most one outstanding
    /// piece per peer, at most one peer per piece. Must run after
    /// `handle_completions` so a piece that just finished verifying is
    /// already reflected in the local bitfield and its peer is already
    /// back to `Unchoked`, not still sitting in `PieceComplete`.
    fn select_pieces(&self) {
        let mut state = self.state.lock().unwrap();
        if state.bitfield.is_complete() {
            return;
        }

        let stale: Vec<SocketAddr> = state
            .assignments
            .keys()
            .filter(|addr| {
                state.peers.get(*addr).map(|h| h.state() != PeerState::RequestingPiece).unwrap_or(true)
            })
            .copied()
            .collect();
        for addr in stale {
            state.assignments.remove(&addr);
        }

        let mut assigned_pieces: HashSet<usize> = state.assignments.values().copied().collect();
        let mut busy_peers: HashSet<SocketAddr> = state.assignments.keys().copied().collect();

        let num_pieces = self.torrent.num_pieces();
        for index in 0..num_pieces {
            if state.bitfield.has(index) || assigned_pieces.contains(&index) {
                continue;
            }

            let candidate = state
                .peers
                .iter()
                .find(|(addr, h)| {
                    !busy_peers.contains(*addr) && h.state() == PeerState::Unchoked && h.has_piece(index)
                })
                .map(|(addr, _)| *addr);

            let Some(addr) = candidate else { continue };
            let size = self.torrent.piece_size(index) as u32;
            let requested = state.peers.get(&addr).map(|h| h.request_piece(index, size)).unwrap_or(false);
            if requested {
                state.assignments.insert(addr, index);
                assigned_pieces.insert(index);
                busy_peers.insert(addr);
            }
        }
    }

    /// SHA-1 verifies every peer currently sitting in `PieceComplete`;
    /// writes verified buffers to disk and marks the local bitfield, or
    /// discards and logs on a digest mismatch. Either way the peer is
    /// returned to service.
    fn handle_completions(&self) {
        let completions: Vec<(SocketAddr, usize, Vec<u8>)> = {
            let state = self.state.lock().unwrap();
            state
                .peers
                .iter()
                .filter_map(|(addr, h)| h.take_completed_piece().map(|(index, buf)| (*addr, index, buf)))
                .collect()
        };

        for (addr, index, buffer) in completions {
            let expected = self.torrent.pieces_hash.get(index);
            let verified = expected.is_some_and(|expected| {
                let mut hasher = Sha1::new();
                hasher.update(&buffer);
                let digest: [u8; 20] = hasher.finalize().into();
                &digest == expected
            });

            if verified {
                let segments =
                    segment::segments_for_piece(&self.torrent.info, index, self.torrent.info.piece_length);
                match segment::write_segments(&self.config.base_dir, &segments, &buffer) {
                    Ok(()) => {
                        self.state.lock().unwrap().bitfield.set(index);
                        info!(index, "piece verified and written");
                    }
                    Err(e) => warn!(index, error = %e, "failed writing verified piece to disk"),
                }
            } else {
                warn!(index, %addr, "piece failed SHA-1 verification, discarding");
            }

            let mut state = self.state.lock().unwrap();
            state.assignments.remove(&addr);
            if let Some(handle) = state.peers.get(&addr) {
                if handle.state() == PeerState::PieceComplete {
                    handle.set_state(PeerState::Unchoked);
                }
            }
        }
    }
}
