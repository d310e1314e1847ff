//! Per-peer binary framing state machine: `WAIT_LENGTH -> WAIT_ID -> WAIT_PAYLOAD -> DONE`.
//!
//! A [`Framer`] is driven by repeated [`Framer::feed`] calls carrying arbitrary byte-stream
//! chunks; it dispatches each fully-framed [`Message`] exactly once, regardless of how the
//! input bytes were chopped up.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::config::BLOCKSIZE;
use crate::message::{
    Message, Request, ID_BITFIELD, ID_CANCEL, ID_CHOKE, ID_HAVE, ID_INTERESTED, ID_NOT_INTERESTED,
    ID_PIECE, ID_REQUEST, ID_UNCHOKE,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("message id {id} declared invalid length {len}")]
    InvalidLength { id: u8, len: u32 },
}

enum State {
    WaitLength { buf: [u8; 4], filled: usize },
    WaitId { len: u32 },
    WaitPayload { id: u8, len: u32, buf: Vec<u8> },
}

impl Default for State {
    fn default() -> Self {
        State::WaitLength {
            buf: [0; 4],
            filled: 0,
        }
    }
}

pub struct Framer {
    num_pieces: usize,
    state: State,
}

impl Framer {
    pub fn new(num_pieces: usize) -> Self {
        Framer {
            num_pieces,
            state: State::default(),
        }
    }

    /// Feed an arbitrary chunk of the peer's byte stream, appending every message dispatched as
    /// a result to `out`. Returns as soon as a frame fails validation; the caller is expected to
    /// treat any error as fatal for this peer and stop consuming its buffer.
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<Message>) -> Result<(), FramerError> {
        while !data.is_empty() {
            data = self.step(data, out)?;
        }
        Ok(())
    }

    /// Consume as many bytes of `data` as needed to make one state transition (possibly
    /// reaching `DONE` and dispatching a message), returning the unconsumed tail.
    fn step<'a>(&mut self, data: &'a [u8], out: &mut Vec<Message>) -> Result<&'a [u8], FramerError> {
        match &mut self.state {
            State::WaitLength { buf, filled } => {
                let need = 4 - *filled;
                let take = need.min(data.len());
                buf[*filled..*filled + take].copy_from_slice(&data[..take]);
                *filled += take;
                let rest = &data[take..];
                if *filled == 4 {
                    let len = BigEndian::read_u32(buf);
                    if len == 0 {
                        out.push(Message::KeepAlive);
                        self.state = State::default();
                    } else {
                        self.state = State::WaitId { len };
                    }
                }
                Ok(rest)
            }
            State::WaitId { len } => {
                let len = *len;
                let id = data[0];
                let rest = &data[1..];
                validate_length(id, len, self.num_pieces)?;
                if len == 1 {
                    out.push(decode_message(id, &[])?);
                    self.state = State::default();
                } else {
                    self.state = State::WaitPayload {
                        id,
                        len,
                        buf: Vec::with_capacity(len as usize - 1),
                    };
                }
                Ok(rest)
            }
            State::WaitPayload { id, len, buf } => {
                let total_payload = *len as usize - 1;
                let need = total_payload - buf.len();
                let take = need.min(data.len());
                buf.extend_from_slice(&data[..take]);
                let rest = &data[take..];
                if buf.len() == total_payload {
                    out.push(decode_message(*id, buf)?);
                    self.state = State::default();
                }
                Ok(rest)
            }
        }
    }
}

fn validate_length(id: u8, len: u32, num_pieces: usize) -> Result<(), FramerError> {
    let ok = match id {
        ID_CHOKE | ID_UNCHOKE | ID_INTERESTED | ID_NOT_INTERESTED => len == 1,
        ID_HAVE => len == 5,
        ID_BITFIELD => len == 1 + bitfield_bytes(num_pieces) as u32,
        ID_REQUEST | ID_CANCEL => len == 13,
        ID_PIECE => (10..=9 + BLOCKSIZE).contains(&len),
        _ => return Err(FramerError::UnknownMessageId(id)),
    };
    if ok {
        Ok(())
    } else {
        Err(FramerError::InvalidLength { id, len })
    }
}

fn bitfield_bytes(num_pieces: usize) -> usize {
    num_pieces.div_ceil(8)
}

fn decode_message(id: u8, payload: &[u8]) -> Result<Message, FramerError> {
    match id {
        ID_CHOKE => Ok(Message::Choke),
        ID_UNCHOKE => Ok(Message::Unchoke),
        ID_INTERESTED => Ok(Message::Interested),
        ID_NOT_INTERESTED => Ok(Message::NotInterested),
        ID_HAVE => Ok(Message::Have(BigEndian::read_u32(payload))),
        ID_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
        ID_REQUEST => Ok(Message::Request(decode_request(payload))),
        ID_PIECE => Ok(Message::Piece {
            index: BigEndian::read_u32(&payload[0..4]),
            begin: BigEndian::read_u32(&payload[4..8]),
            block: payload[8..].to_vec(),
        }),
        ID_CANCEL => Ok(Message::Cancel(decode_request(payload))),
        other => Err(FramerError::UnknownMessageId(other)),
    }
}

fn decode_request(payload: &[u8]) -> Request {
    Request::new(
        BigEndian::read_u32(&payload[0..4]),
        BigEndian::read_u32(&payload[4..8]),
        BigEndian::read_u32(&payload[8..12]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_feed_dispatches_have_exactly_once() {
        let whole: &[u8] = &[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x07];
        let chunks: [&[u8]; 3] = [&whole[0..2], &whole[2..6], &whole[6..9]];

        let mut framer = Framer::new(32);
        let mut dispatched = Vec::new();
        for chunk in chunks {
            framer.feed(chunk, &mut dispatched).unwrap();
        }

        assert_eq!(dispatched, vec![Message::Have(7)]);
    }

    #[test]
    fn whole_stream_matches_any_byte_wise_partition() {
        let mut msgs = Vec::new();
        msgs.extend(Message::Choke.encode());
        msgs.extend(Message::Have(3).encode());
        msgs.extend(Message::Request(Request::new(0, 0, 16384)).encode());

        let mut whole_out = Vec::new();
        Framer::new(8).feed(&msgs, &mut whole_out).unwrap();

        // Every byte-wise partition into single-byte chunks must produce the same dispatch.
        let mut framer = Framer::new(8);
        let mut chunked_out = Vec::new();
        for b in &msgs {
            framer.feed(std::slice::from_ref(b), &mut chunked_out).unwrap();
        }

        assert_eq!(whole_out, chunked_out);
        assert_eq!(
            whole_out,
            vec![
                Message::Choke,
                Message::Have(3),
                Message::Request(Request::new(0, 0, 16384)),
            ]
        );
    }

    #[test]
    fn keepalive_is_dispatched_and_framer_resets() {
        let mut out = Vec::new();
        let mut framer = Framer::new(8);
        framer.feed(&[0, 0, 0, 0], &mut out).unwrap();
        assert_eq!(out, vec![Message::KeepAlive]);

        out.clear();
        framer.feed(&Message::Choke.encode(), &mut out).unwrap();
        assert_eq!(out, vec![Message::Choke]);
    }

    #[test]
    fn piece_message_at_max_length_is_accepted() {
        let block = vec![0u8; BLOCKSIZE as usize];
        let bytes = Message::Piece {
            index: 0,
            begin: 0,
            block,
        }
        .encode();
        let mut out = Vec::new();
        Framer::new(8).feed(&bytes, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn piece_message_one_byte_over_max_is_rejected() {
        // 10 + BLOCKSIZE total length -> one byte over the 9 + BLOCKSIZE cap.
        let mut bytes = vec![0u8; 4 + 1 + 8 + BLOCKSIZE as usize + 1];
        BigEndian::write_u32(&mut bytes[0..4], 10 + BLOCKSIZE);
        bytes[4] = ID_PIECE;
        let mut out = Vec::new();
        let err = Framer::new(8).feed(&bytes, &mut out).unwrap_err();
        assert_eq!(
            err,
            FramerError::InvalidLength {
                id: ID_PIECE,
                len: 10 + BLOCKSIZE
            }
        );
    }

    #[test]
    fn bitfield_of_wrong_length_is_rejected() {
        // num_pieces = 10 -> expected payload of ceil(10/8) = 2 bytes, total length 3.
        let mut bytes = vec![0u8; 4 + 1 + 1];
        BigEndian::write_u32(&mut bytes[0..4], 2);
        bytes[4] = ID_BITFIELD;
        let mut out = Vec::new();
        assert!(Framer::new(10).feed(&bytes, &mut out).is_err());
    }

    #[test]
    fn have_declared_with_length_one_is_rejected_before_decoding() {
        // `have` needs a 4-byte payload (len == 5); a malformed len == 1 frame must be rejected
        // by validate_length, not handed to decode_message with an empty payload.
        let bytes: &[u8] = &[0x00, 0x00, 0x00, 0x01, ID_HAVE];
        let mut out = Vec::new();
        let err = Framer::new(8).feed(bytes, &mut out).unwrap_err();
        assert_eq!(
            err,
            FramerError::InvalidLength {
                id: ID_HAVE,
                len: 1
            }
        );
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_message_id_is_rejected() {
        let mut bytes = vec![0u8; 5];
        BigEndian::write_u32(&mut bytes[0..4], 1);
        bytes[4] = 200;
        let mut out = Vec::new();
        assert!(Framer::new(8).feed(&bytes, &mut out).is_err());
    }
}
