//! The eight base wire messages and their `(piece_index, begin, length)` request triple.

use byteorder::{BigEndian, ByteOrder};

/// A `(piece_index, begin, length)` triple referring to one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        Request {
            piece_index,
            begin,
            length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(Request),
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel(Request),
}

pub const ID_CHOKE: u8 = 0;
pub const ID_UNCHOKE: u8 = 1;
pub const ID_INTERESTED: u8 = 2;
pub const ID_NOT_INTERESTED: u8 = 3;
pub const ID_HAVE: u8 = 4;
pub const ID_BITFIELD: u8 = 5;
pub const ID_REQUEST: u8 = 6;
pub const ID_PIECE: u8 = 7;
pub const ID_CANCEL: u8 = 8;

impl Message {
    /// Frame this message as `u32 length | u8 id | payload`, or the 4 zero bytes of a keepalive.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => frame(ID_CHOKE, &[]),
            Message::Unchoke => frame(ID_UNCHOKE, &[]),
            Message::Interested => frame(ID_INTERESTED, &[]),
            Message::NotInterested => frame(ID_NOT_INTERESTED, &[]),
            Message::Have(index) => {
                let mut payload = [0u8; 4];
                BigEndian::write_u32(&mut payload, *index);
                frame(ID_HAVE, &payload)
            }
            Message::Bitfield(bits) => frame(ID_BITFIELD, bits),
            Message::Request(r) => frame(ID_REQUEST, &encode_request(r)),
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                let mut head = [0u8; 8];
                BigEndian::write_u32(&mut head[0..4], *index);
                BigEndian::write_u32(&mut head[4..8], *begin);
                payload.extend_from_slice(&head);
                payload.extend_from_slice(block);
                frame(ID_PIECE, &payload)
            }
            Message::Cancel(r) => frame(ID_CANCEL, &encode_request(r)),
        }
    }
}

fn encode_request(r: &Request) -> [u8; 12] {
    let mut payload = [0u8; 12];
    BigEndian::write_u32(&mut payload[0..4], r.piece_index);
    BigEndian::write_u32(&mut payload[4..8], r.begin);
    BigEndian::write_u32(&mut payload[8..12], r.length);
    payload
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + payload.len());
    let len = 1 + payload.len() as u32;
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, len);
    out.extend_from_slice(&len_buf);
    out.push(id);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_keepalive_as_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn encodes_have_with_length_five() {
        let bytes = Message::Have(7).encode();
        assert_eq!(bytes, vec![0, 0, 0, 5, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn encodes_request_with_length_thirteen() {
        let bytes = Message::Request(Request::new(1, 16384, 16384)).encode();
        assert_eq!(bytes.len(), 4 + 13);
        assert_eq!(bytes[4], ID_REQUEST);
    }
}
