//! The 68-byte handshake that precedes every peer connection: a protocol-name prefix, 8 reserved
//! bytes, the 20-byte info-hash, and the 20-byte peer-id.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::config::{HANDSHAKE_LEN, HASH_LEN, PROTOCOL_NAME};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection mid-handshake after {0} of {HANDSHAKE_LEN} bytes")]
    Truncated(usize),
    #[error("unexpected protocol name")]
    WrongProtocol,
    #[error("info-hash mismatch")]
    InfoHashMismatch,
    #[error("remote peer-id did not match the tracker-hinted value")]
    PeerIdMismatch,
}

pub fn build(info_hash: &[u8; HASH_LEN], peer_id: &[u8; HASH_LEN]) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = PROTOCOL_NAME.len() as u8;
    let protocol_end = 1 + PROTOCOL_NAME.len();
    buf[1..protocol_end].copy_from_slice(PROTOCOL_NAME);
    // bytes [protocol_end..protocol_end + 8] are the reserved flags; left zeroed.
    let hash_start = protocol_end + 8;
    buf[hash_start..hash_start + HASH_LEN].copy_from_slice(info_hash);
    buf[hash_start + HASH_LEN..].copy_from_slice(peer_id);
    buf
}

/// Write the handshake, then read the peer's own handshake looping until all `HANDSHAKE_LEN`
/// bytes are collected or the peer closes the connection. Validates the protocol prefix and the
/// info-hash; if `expected_peer_id` is given, also validates the remote peer-id.
pub fn perform(
    stream: &mut TcpStream,
    info_hash: &[u8; HASH_LEN],
    peer_id: &[u8; HASH_LEN],
    expected_peer_id: Option<&[u8; HASH_LEN]>,
) -> Result<[u8; HASH_LEN], HandshakeError> {
    stream.write_all(&build(info_hash, peer_id))?;

    let mut response = [0u8; HANDSHAKE_LEN];
    let mut filled = 0;
    while filled < HANDSHAKE_LEN {
        let n = stream.read(&mut response[filled..])?;
        if n == 0 {
            return Err(HandshakeError::Truncated(filled));
        }
        filled += n;
    }

    if response[0] as usize != PROTOCOL_NAME.len() || &response[1..1 + PROTOCOL_NAME.len()] != PROTOCOL_NAME {
        return Err(HandshakeError::WrongProtocol);
    }

    let hash_start = 1 + PROTOCOL_NAME.len() + 8;
    if &response[hash_start..hash_start + HASH_LEN] != info_hash {
        return Err(HandshakeError::InfoHashMismatch);
    }

    let mut remote_peer_id = [0u8; HASH_LEN];
    remote_peer_id.copy_from_slice(&response[hash_start + HASH_LEN..]);

    if let Some(expected) = expected_peer_id {
        if &remote_peer_id != expected {
            return Err(HandshakeError::PeerIdMismatch);
        }
    }

    Ok(remote_peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn builds_handshake_of_fixed_length() {
        let info_hash = [7u8; HASH_LEN];
        let peer_id = [9u8; HASH_LEN];
        let bytes = build(&info_hash, &peer_id);
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0] as usize, PROTOCOL_NAME.len());
        assert_eq!(&bytes[1..1 + PROTOCOL_NAME.len()], PROTOCOL_NAME);
        assert_eq!(&bytes[bytes.len() - HASH_LEN..], &peer_id);
    }

    #[test]
    fn round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [1u8; HASH_LEN];
        let our_id = [2u8; HASH_LEN];
        let their_id = [3u8; HASH_LEN];

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&build(&info_hash, &their_id)).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let remote_id = perform(&mut client, &info_hash, &our_id, None).unwrap();
        assert_eq!(remote_id, their_id);
        server.join().unwrap();
    }

    #[test]
    fn mismatched_info_hash_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let their_hash = [5u8; HASH_LEN];

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&build(&their_hash, &[9u8; HASH_LEN])).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let err = perform(&mut client, &[1u8; HASH_LEN], &[2u8; HASH_LEN], None).unwrap_err();
        assert!(matches!(err, HandshakeError::InfoHashMismatch));
        server.join().unwrap();
    }

    #[test]
    fn truncated_response_is_reported_with_bytes_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&[0u8; 10]).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let err = perform(&mut client, &[1u8; HASH_LEN], &[2u8; HASH_LEN], None).unwrap_err();
        assert!(matches!(err, HandshakeError::Truncated(10)));
        server.join().unwrap();
    }
}
