//! Per-connection protocol state: framing, choke/interest flags, piece availability, and the
//! in-flight request queues. The swarm loop drives [`Peer::service_read`] /
//! [`Peer::service_write`] on readiness and otherwise only touches the outbound API.

use std::collections::HashSet;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddrV4;

use mio::net::TcpStream;
use thiserror::Error;
use tracing::trace;

use crate::bitfield::Bitfield;
use crate::config::{HASH_LEN, MAX_INBOUND_REQUESTS};
use crate::framer::{Framer, FramerError};
use crate::message::{Message, Request};
use crate::piece_store::{PieceStore, StoreError};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramerError),
    #[error("piece store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one read or write attempt on the underlying socket.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    /// The socket made progress (or had nothing to do); the peer stays live.
    Progressed,
    /// The peer closed the connection in an orderly fashion.
    Closed,
}

pub struct Peer {
    address: SocketAddrV4,
    remote_peer_id: [u8; HASH_LEN],
    num_pieces: usize,
    socket: TcpStream,
    downloaded: u64,
    uploaded: u64,
    framer: Framer,
    write_buffer: Vec<u8>,
    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,
    peer_has: Bitfield,
    inbound_requests: Vec<Request>,
    outbound_requests: HashSet<Request>,
    completed_requests: Vec<Request>,
    dead: bool,
}

impl Peer {
    pub fn new(
        socket: TcpStream,
        address: SocketAddrV4,
        remote_peer_id: [u8; HASH_LEN],
        num_pieces: usize,
    ) -> Self {
        Peer {
            address,
            remote_peer_id,
            num_pieces,
            socket,
            downloaded: 0,
            uploaded: 0,
            framer: Framer::new(num_pieces),
            write_buffer: Vec::new(),
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            peer_has: Bitfield::zeros(num_pieces),
            inbound_requests: Vec::new(),
            outbound_requests: HashSet::new(),
            completed_requests: Vec::new(),
            dead: false,
        }
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn remote_peer_id(&self) -> &[u8; HASH_LEN] {
        &self.remote_peer_id
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.downloaded, self.uploaded)
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_has(&self) -> &Bitfield {
        &self.peer_has
    }

    pub fn outbound_request_count(&self) -> usize {
        self.outbound_requests.len()
    }

    pub fn has_outbound_request(&self, request: &Request) -> bool {
        self.outbound_requests.contains(request)
    }

    pub fn take_completed_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.completed_requests)
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Receive up to one `BUFFER_SIZE` read's worth of bytes and run every message it yields
    /// through the handlers. A framing or store error marks the peer dead rather than
    /// propagating, since by that point the connection is no longer trustworthy.
    pub fn service_read(&mut self, buffer_size: usize, store: &mut PieceStore) -> Result<IoOutcome, PeerError> {
        let mut buf = vec![0u8; buffer_size];
        match self.socket.read(&mut buf) {
            Ok(0) => Ok(IoOutcome::Closed),
            Ok(n) => {
                self.downloaded += n as u64;
                let mut messages = Vec::new();
                if let Err(e) = self.framer.feed(&buf[..n], &mut messages) {
                    self.dead = true;
                    return Err(PeerError::Framing(e));
                }
                for message in messages {
                    if let Err(e) = self.handle_message(message, store) {
                        self.dead = true;
                        return Err(e);
                    }
                    if self.dead {
                        break;
                    }
                }
                Ok(IoOutcome::Progressed)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(IoOutcome::Progressed),
            Err(e) => Err(PeerError::Io(e)),
        }
    }

    /// Send as much of `write_buffer` as the socket accepts without blocking.
    pub fn service_write(&mut self) -> Result<IoOutcome, PeerError> {
        if self.write_buffer.is_empty() {
            return Ok(IoOutcome::Progressed);
        }
        match self.socket.write(&self.write_buffer) {
            Ok(0) => Ok(IoOutcome::Closed),
            Ok(n) => {
                self.uploaded += n as u64;
                self.write_buffer.drain(..n);
                Ok(IoOutcome::Progressed)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(IoOutcome::Progressed),
            Err(e) => Err(PeerError::Io(e)),
        }
    }

    fn handle_message(&mut self, message: Message, store: &mut PieceStore) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if index as usize >= self.num_pieces {
                    self.dead = true;
                } else {
                    self.peer_has.set(index as usize);
                }
            }
            Message::Bitfield(bytes) => {
                self.peer_has = Bitfield::from_packed_bytes(&bytes).truncated(self.num_pieces);
            }
            Message::Request(request) => {
                let verified = store
                    .piece(request.piece_index as usize)
                    .map(|p| p.verified)
                    .unwrap_or(false);
                if !verified || self.am_choking || self.inbound_requests.len() >= MAX_INBOUND_REQUESTS {
                    self.dead = true;
                } else {
                    self.inbound_requests.push(request);
                }
            }
            Message::Piece { index, begin, block } => {
                let request = Request::new(index, begin, block.len() as u32);
                if !self.outbound_requests.remove(&request) {
                    self.dead = true;
                    return Ok(());
                }
                let already_verified = store.piece(index as usize).map(|p| p.verified).unwrap_or(true);
                if already_verified {
                    trace!(index, begin, "dropping block for already-verified piece");
                    return Ok(());
                }
                store.store_block(index as usize, begin, &block)?;
                self.completed_requests.push(request);
            }
            Message::Cancel(request) => {
                match self.inbound_requests.iter().position(|r| *r == request) {
                    Some(pos) => {
                        self.inbound_requests.remove(pos);
                    }
                    None => self.dead = true,
                }
            }
        }
        Ok(())
    }

    pub fn send_keepalive(&mut self) {
        self.write_buffer.extend(Message::KeepAlive.encode());
    }

    pub fn choke(&mut self) {
        if !self.am_choking {
            self.am_choking = true;
            self.write_buffer.extend(Message::Choke.encode());
        }
    }

    pub fn unchoke(&mut self) {
        if self.am_choking {
            self.am_choking = false;
            self.write_buffer.extend(Message::Unchoke.encode());
        }
    }

    pub fn interested(&mut self) {
        if !self.am_interested {
            self.am_interested = true;
            self.write_buffer.extend(Message::Interested.encode());
        }
    }

    pub fn not_interested(&mut self) {
        if self.am_interested {
            self.am_interested = false;
            self.write_buffer.extend(Message::NotInterested.encode());
        }
    }

    /// Announce a newly-verified piece. Precondition: `store.piece(index)` is verified.
    pub fn send_have(&mut self, index: u32, store: &PieceStore) {
        debug_assert!(store.piece(index as usize).map(|p| p.verified).unwrap_or(false));
        self.write_buffer.extend(Message::Have(index).encode());
    }

    pub fn send_bitfield(&mut self, store: &PieceStore) {
        self.write_buffer.extend(Message::Bitfield(store.bitfield()).encode());
    }

    pub fn request(&mut self, request: Request) {
        self.outbound_requests.insert(request);
        self.write_buffer.extend(Message::Request(request).encode());
    }

    /// Send a block of a verified piece. Precondition: `store.piece(request.piece_index)` is
    /// verified.
    pub fn send_block(&mut self, request: Request, store: &PieceStore) -> Result<(), PeerError> {
        let block = store.read_block(request.piece_index as usize, request.begin, request.length)?;
        self.write_buffer.extend(
            Message::Piece {
                index: request.piece_index,
                begin: request.begin,
                block: block.to_vec(),
            }
            .encode(),
        );
        Ok(())
    }

    pub fn send_cancel(&mut self, request: Request) {
        self.outbound_requests.remove(&request);
        self.write_buffer.extend(Message::Cancel(request).encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HASH_LEN;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), server)
    }

    fn make_peer(num_pieces: usize) -> (Peer, std::net::TcpStream) {
        let (client, server) = connected_pair();
        let addr: SocketAddrV4 = "127.0.0.1:6881".parse().unwrap();
        let peer = Peer::new(client, addr, [0u8; HASH_LEN], num_pieces);
        (peer, server)
    }

    #[test]
    fn choke_unchoke_are_idempotent() {
        let (mut peer, _server) = make_peer(4);
        peer.unchoke();
        assert!(!peer.am_choking);
        assert_eq!(peer.write_buffer, Message::Unchoke.encode());

        peer.write_buffer.clear();
        peer.unchoke();
        assert!(peer.write_buffer.is_empty());
    }

    #[test]
    fn have_with_out_of_range_index_marks_peer_dead() {
        let (mut peer, mut server) = make_peer(2);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), 2, 1, &[0u8; 2 * HASH_LEN]).unwrap();

        use std::io::Write as _;
        server.write_all(&Message::Have(9).encode()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.service_read(4096, &mut store).unwrap();
        assert!(peer.is_dead());
    }

    #[test]
    fn request_for_unverified_piece_marks_peer_dead() {
        let (mut peer, mut server) = make_peer(1);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), 16, 16, &[0u8; HASH_LEN]).unwrap();
        peer.unchoke();

        use std::io::Write as _;
        server
            .write_all(&Message::Request(Request::new(0, 0, 16)).encode())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.service_read(4096, &mut store).unwrap();
        assert!(peer.is_dead());
    }

    #[test]
    fn have_at_num_pieces_after_bitfield_padding_marks_peer_dead() {
        // 10 pieces packs to 2 bytes (16 bits) of wire padding; a have(10) must still kill the
        // peer even though bit 10 exists in the padded byte string.
        let (mut peer, mut server) = make_peer(10);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), 10, 1, &[0u8; 10 * HASH_LEN]).unwrap();

        use std::io::Write as _;
        server
            .write_all(&Message::Bitfield(vec![0u8; 2]).encode())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.service_read(4096, &mut store).unwrap();
        assert!(!peer.is_dead());
        assert_eq!(peer.peer_has.len(), 10);

        server.write_all(&Message::Have(10).encode()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.service_read(4096, &mut store).unwrap();
        assert!(peer.is_dead());
    }

    #[test]
    fn unsolicited_piece_marks_peer_dead() {
        let (mut peer, mut server) = make_peer(1);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), 16, 16, &[0u8; HASH_LEN]).unwrap();

        use std::io::Write as _;
        server
            .write_all(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: vec![0u8; 16],
                }
                .encode(),
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.service_read(4096, &mut store).unwrap();
        assert!(peer.is_dead());
    }
}
