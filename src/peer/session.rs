//! A single remote peer's connection and state machine.
//!
//! Each session owns its TCP connection, its view of the remote peer's
//! bitfield, and its in-flight [`PendingPiece`]; the swarm manager only
//! ever observes state through the handle returned by [`spawn`] — it never
//! reaches into the session's buffer directly, matching the "the session
//! owns it, the manager observes only the terminal state" design note.
use crate::bitfield::Bitfield;
use crate::wire::handshake::Handshake;
use crate::wire::message::{Message, BLOCK_MAX};
use crate::wire::WireError;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::PeerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unset,
    Error,
    Ready,
    Unchoked,
    RequestingPiece,
    PieceComplete,
}

#[derive(Debug)]
struct PendingPiece {
    index: usize,
    total_size: u32,
    buffer: Vec<u8>,
    next_offset: u32,
}

/// Instruction the manager sends into a running session. Everything else
/// a session does (sending `interested`, issuing the next block request)
/// is a reaction to wire traffic and needs no command of its own.
#[derive(Debug)]
pub enum Command {
    RequestPiece { index: usize, total_size: u32 },
}

/// The manager's view of a running peer session: shared, lock-guarded
/// state plus a command channel and a cancellation handle. Dropping this
/// (or cancelling it) tears the session down.
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub remote_peer_id: [u8; 20],
    state: Arc<Mutex<PeerState>>,
    remote_bitfield: Arc<Mutex<Bitfield>>,
    completed_piece: Arc<Mutex<Option<(usize, Vec<u8>)>>>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.remote_bitfield.lock().unwrap().has(index)
    }

    pub fn remote_bitfield(&self) -> Bitfield {
        self.remote_bitfield.lock().unwrap().clone()
    }

    /// Asks the session to start downloading `index`. Returns `false`
    /// (without blocking) if the session is already busy with a piece or
    /// has torn down — the manager simply tries another peer next tick.
    pub fn request_piece(&self, index: usize, total_size: u32) -> bool {
        self.commands.try_send(Command::RequestPiece { index, total_size }).is_ok()
    }

    /// Takes the completed buffer out of a `PieceComplete` session, if any.
    pub fn take_completed_piece(&self) -> Option<(usize, Vec<u8>)> {
        self.completed_piece.lock().unwrap().take()
    }

    /// Used by the manager after verifying (or rejecting) a completed
    /// piece, to put the session back to work.
    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct PeerSession {
    stream: TcpStream,
    state: Arc<Mutex<PeerState>>,
    remote_bitfield: Arc<Mutex<Bitfield>>,
    completed_piece: Arc<Mutex<Option<(usize, Vec<u8>)>>>,
    pending: Option<PendingPiece>,
    read_timeout: Duration,
}

/// Dials `addr`, performs the BEP-3 handshake (5s connect, 5s handshake
/// read), and spawns the session's message loop. On any failure
/// the peer is simply never added to the pool — there is no handle to
/// return.
#[instrument(level = "debug", skip(info_hash, local_peer_id, cancel))]
pub async fn spawn(
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    connect_timeout: Duration,
    handshake_read_timeout: Duration,
    message_read_timeout: Duration,
    cancel: CancellationToken,
) -> PeerResult<PeerHandle> {
    let (stream, handshake) = Handshake::connect_and_handshake(
        addr,
        info_hash,
        local_peer_id,
        connect_timeout,
        handshake_read_timeout,
    )
    .await?;

    let state = Arc::new(Mutex::new(PeerState::Ready));
    let remote_bitfield = Arc::new(Mutex::new(Bitfield::new(num_pieces)));
    let completed_piece = Arc::new(Mutex::new(None));
    let (cmd_tx, cmd_rx) = mpsc::channel(1);

    let session = PeerSession {
        stream,
        state: state.clone(),
        remote_bitfield: remote_bitfield.clone(),
        completed_piece: completed_piece.clone(),
        pending: None,
        read_timeout: message_read_timeout,
    };

    let session_cancel = cancel.clone();
    let task = tokio::spawn(session.run(cmd_rx, session_cancel));

    Ok(PeerHandle {
        addr,
        remote_peer_id: handshake.peer_id,
        state,
        remote_bitfield,
        completed_piece,
        commands: cmd_tx,
        cancel,
        task,
    })
}

impl PeerSession {
    fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::RequestPiece { index, total_size }) => {
                            if let Err(e) = self.begin_request(index, total_size).await {
                                warn!(error = %e, "failed to issue initial piece request");
                                self.set_state(PeerState::Error);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                msg = Message::read(&mut self.stream, self.read_timeout) => {
                    match msg {
                        Ok(Some(message)) => {
                            if let Err(e) = self.handle_message(message).await {
                                warn!(error = %e, "peer session failed handling a message");
                                self.set_state(PeerState::Error);
                                break;
                            }
                        }
                        Ok(None) => {
                            // keep-alive: no-op
                        }
                        Err(e) => {
                            warn!(error = %e, "peer read failed");
                            self.set_state(PeerState::Error);
                            break;
                        }
                    }
                }
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await;
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), WireError> {
        match message {
            Message::Choke => {
                self.set_state(PeerState::Ready);
                self.pending = None;
            }
            Message::Unchoke => {
                if self.state() == PeerState::Ready {
                    self.set_state(PeerState::Unchoked);
                }
            }
            Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => {
                self.remote_bitfield.lock().unwrap().set(piece_index as usize);
            }
            Message::Bitfield(bits) => {
                let num_pieces = self.remote_bitfield.lock().unwrap().num_pieces();
                let expected_len = num_pieces.div_ceil(8);
                if bits.len() != expected_len {
                    return Err(WireError::MalformedMessage(format!(
                        "bitfield length {} != expected {expected_len}",
                        bits.len()
                    )));
                }
                *self.remote_bitfield.lock().unwrap() = Bitfield::from_bytes(bits.to_vec(), num_pieces);
                if self.state() == PeerState::Ready {
                    Message::Interested.write(&mut self.stream).await?;
                }
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                // this client never seeds
            }
            Message::Piece { index, begin, block } => {
                self.on_piece_fragment(index as usize, begin, &block).await?;
            }
        }
        Ok(())
    }

    /// Transitions into `RequestingPiece` and fires the initial block
    /// request. The first request uses `min(2^14 - 1, total_size)`
    /// rather than the `2^14` used by every later request in this piece —
    /// that asymmetry is specified, not a bug.
    async fn begin_request(&mut self, index: usize, total_size: u32) -> Result<(), WireError> {
        self.set_state(PeerState::RequestingPiece);
        self.pending = Some(PendingPiece { index, total_size, buffer: vec![0u8; total_size as usize], next_offset: 0 });
        let first_len = std::cmp::min(BLOCK_MAX - 1, total_size);
        Message::request(index as u32, 0, first_len).write(&mut self.stream).await
    }

    async fn on_piece_fragment(&mut self, index: usize, begin: u32, block: &[u8]) -> Result<(), WireError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.index != index {
            return Ok(());
        }

        let begin = begin as usize;
        let end = begin + block.len();
        if end > pending.buffer.len() {
            return Err(WireError::MalformedMessage("piece block overruns buffer".to_string()));
        }
        pending.buffer[begin..end].copy_from_slice(block);
        pending.next_offset = end as u32;

        if pending.next_offset < pending.total_size {
            let remaining = pending.total_size - pending.next_offset;
            let next_len = std::cmp::min(BLOCK_MAX, remaining);
            let (index, offset) = (pending.index as u32, pending.next_offset);
            Message::request(index, offset, next_len).write(&mut self.stream).await?;
        } else {
            let pending = self.pending.take().unwrap();
            *self.completed_piece.lock().unwrap() = Some((pending.index, pending.buffer));
            self.set_state(PeerState::PieceComplete);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::Message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [7u8; 20];
    const LOCAL_PEER_ID: [u8; 20] = [1u8; 20];
    const REMOTE_PEER_ID: [u8; 20] = [2u8; 20];

    /// Drives a full session lifecycle against a fake remote peer on a
    /// loopback socket: handshake, bitfield (→ we send Interested),
    /// unchoke (→ Unchoked), a piece request/fragment round-trip small
    /// enough to complete in one block, ending in `PieceComplete` with the
    /// exact bytes the fake peer sent.
    #[tokio::test]
    async fn full_session_lifecycle_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let piece_bytes = vec![0xabu8; 16];
        let expected_piece = piece_bytes.clone();
        let fake_peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut hs_buf = [0u8; 68];
            stream.read_exact(&mut hs_buf).await.unwrap();
            assert_eq!(&hs_buf[28..48], &INFO_HASH);

            let reply = Handshake::new(INFO_HASH, REMOTE_PEER_ID);
            reply.write(&mut stream).await.unwrap();

            Message::Bitfield(bytes::Bytes::from_static(&[0b1000_0000])).write(&mut stream).await.unwrap();
            Message::Unchoke.write(&mut stream).await.unwrap();

            let interested = Message::read(&mut stream, Duration::from_secs(5)).await.unwrap();
            assert_eq!(interested, Some(Message::Interested));

            let request = Message::read(&mut stream, Duration::from_secs(5)).await.unwrap();
            let Some(Message::Request { index, begin, length }) = request else {
                panic!("expected a request message");
            };
            assert_eq!((index, begin, length), (0, 0, 16));

            Message::Piece { index: 0, begin: 0, block: bytes::Bytes::from(expected_piece) }
                .write(&mut stream)
                .await
                .unwrap();

            // hold the connection open until the session tears it down.
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        let cancel = CancellationToken::new();
        let handle = spawn(
            addr,
            INFO_HASH,
            LOCAL_PEER_ID,
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            cancel.clone(),
        )
        .await
        .unwrap();

        assert_eq!(handle.remote_peer_id, REMOTE_PEER_ID);

        // Wait for the bitfield + unchoke to land.
        for _ in 0..50 {
            if handle.state() == PeerState::Unchoked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.state(), PeerState::Unchoked);
        assert!(handle.has_piece(0));

        assert!(handle.request_piece(0, 16));

        let mut completed = None;
        for _ in 0..50 {
            if let Some(result) = handle.take_completed_piece() {
                completed = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (index, buffer) = completed.expect("piece did not complete in time");
        assert_eq!(index, 0);
        assert_eq!(buffer, vec![0xabu8; 16]);

        cancel.cancel();
        fake_peer.abort();
    }

    #[tokio::test]
    async fn handshake_info_hash_mismatch_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let fake_peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs_buf = [0u8; 68];
            stream.read_exact(&mut hs_buf).await.unwrap();
            let reply = Handshake::new([99u8; 20], REMOTE_PEER_ID);
            reply.write(&mut stream).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let result = spawn(
            addr,
            INFO_HASH,
            LOCAL_PEER_ID,
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            cancel,
        )
        .await;

        assert!(result.is_err());
        fake_peer.abort();
    }

    /// A remote peer is free to send a malformed `bitfield` (wrong byte
    /// length for `num_pieces`); the session must reject it with an
    /// `Error` state transition rather than panicking on an out-of-range
    /// index the next time someone calls `has_piece`.
    #[tokio::test]
    async fn undersized_bitfield_errors_the_session_instead_of_panicking() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let fake_peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs_buf = [0u8; 68];
            stream.read_exact(&mut hs_buf).await.unwrap();
            let reply = Handshake::new(INFO_HASH, REMOTE_PEER_ID);
            reply.write(&mut stream).await.unwrap();

            // num_pieces = 22 needs a 3-byte bitfield; send only 1.
            Message::Bitfield(bytes::Bytes::from_static(&[0xff])).write(&mut stream).await.unwrap();

            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        let cancel = CancellationToken::new();
        let handle = spawn(
            addr,
            INFO_HASH,
            LOCAL_PEER_ID,
            22,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            cancel.clone(),
        )
        .await
        .unwrap();

        let mut errored = false;
        for _ in 0..50 {
            if handle.state() == PeerState::Error {
                errored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(errored, "session should transition to Error on a malformed bitfield");
        // has_piece must stay safe to call even on the rejected bitfield.
        assert!(!handle.has_piece(0));

        cancel.cancel();
        fake_peer.abort();
    }
}
