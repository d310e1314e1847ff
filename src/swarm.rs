//! The single-threaded, readiness-driven event loop: owns every live [`Peer`] and the
//! [`PieceStore`], and is generic over a [`PieceSelector`] strategy for picking the next block to
//! request from each peer.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddrV4;

use mio::{Events, Interest, Poll, Token};
use rand::rngs::ThreadRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BUFFER_SIZE, HASH_LEN, OUTBOUND_REQUEST_SOFT_CAP, POLL_TIMEOUT, SELECTION_RETRY_LIMIT};
use crate::handshake::{self, HandshakeError};
use crate::message::Request;
use crate::peer::{IoOutcome, Peer, PeerError};
use crate::piece_store::PieceStore;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Picks the next block to request from a peer. The core ships one implementation
/// ([`UniformRandomSelector`]) but the swarm loop does not depend on it directly.
pub trait PieceSelector {
    fn select(&mut self, peer: &Peer, store: &PieceStore) -> Option<Request>;
}

/// Uniform-random choice of wanted piece, then uniform-random choice of missing block within
/// it. Candidates already outstanding against this peer are re-picked up to
/// `SELECTION_RETRY_LIMIT` times before giving up for this peer this iteration.
pub struct UniformRandomSelector {
    rng: ThreadRng,
}

impl UniformRandomSelector {
    pub fn new() -> Self {
        Self { rng: rand::thread_rng() }
    }
}

impl Default for UniformRandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceSelector for UniformRandomSelector {
    fn select(&mut self, peer: &Peer, store: &PieceStore) -> Option<Request> {
        let want = peer.peer_has().and_not(store.verified_bitset());
        if want.is_empty() {
            return None;
        }
        for _ in 0..SELECTION_RETRY_LIMIT {
            let piece_idx = want.random_set_bit(&mut self.rng)?;
            let piece = store.piece(piece_idx)?;
            let block_progress = piece.block_progress()?;
            let block_idx = block_progress.random_unset_bit(&mut self.rng)?;
            let begin = block_idx as u32 * crate::config::BLOCKSIZE;
            let length = piece.block_len(block_idx);
            let request = Request::new(piece_idx as u32, begin, length);
            if !peer.has_outbound_request(&request) {
                return Some(request);
            }
        }
        None
    }
}

pub struct Swarm<S: PieceSelector> {
    poll: Poll,
    peers: HashMap<Token, Peer>,
    next_token: usize,
    store: PieceStore,
    selector: S,
    info_hash: [u8; HASH_LEN],
    our_peer_id: [u8; HASH_LEN],
    total_downloaded: u64,
    total_uploaded: u64,
}

impl<S: PieceSelector> Swarm<S> {
    pub fn new(store: PieceStore, selector: S, info_hash: [u8; HASH_LEN], our_peer_id: [u8; HASH_LEN]) -> io::Result<Self> {
        Ok(Swarm {
            poll: Poll::new()?,
            peers: HashMap::new(),
            next_token: 0,
            store,
            selector,
            info_hash,
            our_peer_id,
            total_downloaded: 0,
            total_uploaded: 0,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.total_downloaded, self.total_uploaded)
    }

    /// Connect to `address`, perform the handshake, and enroll the resulting peer in the loop.
    pub fn connect(&mut self, address: SocketAddrV4) -> Result<(), SwarmError> {
        let mut stream = std::net::TcpStream::connect(address)?;
        let remote_peer_id = handshake::perform(&mut stream, &self.info_hash, &self.our_peer_id, None)?;
        stream.set_nonblocking(true)?;
        let peer = Peer::new(
            mio::net::TcpStream::from_std(stream),
            address,
            remote_peer_id,
            self.store.num_pieces(),
        );
        self.add_peer(peer)?;
        Ok(())
    }

    fn add_peer(&mut self, mut peer: Peer) -> io::Result<()> {
        peer.send_bitfield(&self.store);
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(peer.socket_mut(), token, Interest::READABLE)?;
        debug!(address = %peer.address(), "peer connected");
        self.peers.insert(token, peer);
        Ok(())
    }

    /// Run until every piece is verified.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            self.reap_and_rearm()?;
            if self.store.is_complete() {
                info!("download complete");
                return Ok(());
            }
            self.poll.poll(&mut events, Some(POLL_TIMEOUT))?;
            self.service_events(&events);
            self.publish_completions();
            if self.store.is_complete() {
                info!("download complete");
                return Ok(());
            }
            self.select_requests();
        }
    }

    fn reap_and_rearm(&mut self) -> io::Result<()> {
        let dead_tokens: Vec<Token> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_dead())
            .map(|(token, _)| *token)
            .collect();
        for token in dead_tokens {
            if let Some(mut peer) = self.peers.remove(&token) {
                let _ = self.poll.registry().deregister(peer.socket_mut());
                let (downloaded, uploaded) = peer.counters();
                self.total_downloaded += downloaded;
                self.total_uploaded += uploaded;
                debug!(address = %peer.address(), "reaped dead peer");
            }
        }
        for (token, peer) in self.peers.iter_mut() {
            let interest = if peer.has_pending_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll.registry().reregister(peer.socket_mut(), *token, interest)?;
        }
        Ok(())
    }

    fn service_events(&mut self, events: &Events) {
        for event in events.iter() {
            let token = event.token();
            if event.is_readable() {
                if let Some(peer) = self.peers.get_mut(&token) {
                    match peer.service_read(BUFFER_SIZE, &mut self.store) {
                        Ok(IoOutcome::Closed) => peer.mark_dead(),
                        Ok(IoOutcome::Progressed) => {}
                        Err(e) => mark_dead_on_error(peer, e),
                    }
                }
            }
            if event.is_writable() {
                if let Some(peer) = self.peers.get_mut(&token) {
                    match peer.service_write() {
                        Ok(IoOutcome::Closed) => peer.mark_dead(),
                        Ok(IoOutcome::Progressed) => {}
                        Err(e) => mark_dead_on_error(peer, e),
                    }
                }
            }
        }
    }

    /// Drain each peer's completed block requests, collect the set of pieces newly verified as
    /// a result, and announce a `have` for each to every peer.
    fn publish_completions(&mut self) {
        let mut newly_verified = HashSet::new();
        for peer in self.peers.values_mut() {
            for request in peer.take_completed_requests() {
                if self.store.piece(request.piece_index as usize).map(|p| p.verified).unwrap_or(false) {
                    newly_verified.insert(request.piece_index);
                }
            }
        }
        if newly_verified.is_empty() {
            return;
        }
        for peer in self.peers.values_mut() {
            for &index in &newly_verified {
                peer.send_have(index, &self.store);
            }
        }
    }

    fn select_requests(&mut self) {
        let store = &self.store;
        let selector = &mut self.selector;
        for peer in self.peers.values_mut() {
            let want = peer.peer_has().and_not(store.verified_bitset());
            if want.is_empty() {
                continue;
            }
            peer.interested();
            if peer.peer_choking() {
                continue;
            }
            if peer.outbound_request_count() > OUTBOUND_REQUEST_SOFT_CAP {
                continue;
            }
            if let Some(request) = selector.select(peer, store) {
                peer.request(request);
            }
        }
    }
}

fn mark_dead_on_error(peer: &mut Peer, err: PeerError) {
    warn!(address = %peer.address(), error = %err, "peer connection error");
    peer.mark_dead();
}
