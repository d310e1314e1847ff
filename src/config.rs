//! Wire and scheduling constants shared across the piece store, peer connection and swarm loop.

use std::time::Duration;

/// Size of a single block: the unit of wire transfer and of `block_progress` bits.
pub const BLOCKSIZE: u32 = 16384;

/// Default number of bytes read from a socket per readiness event.
pub const BUFFER_SIZE: usize = 4096;

/// A peer that queues more than this many unanswered `request`s is misbehaving.
pub const MAX_INBOUND_REQUESTS: usize = 512;

/// Soft cap on how many blocks we keep outstanding against a single peer at once.
pub const OUTBOUND_REQUEST_SOFT_CAP: usize = 20;

/// How many times the piece selector may re-pick before giving up on a peer for this iteration.
pub const SELECTION_RETRY_LIMIT: usize = 8;

/// Upper bound on how long a single `poll` call may block, so idle loops still make keepalive
/// and re-announce progress.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Length in bytes of a SHA-1 digest / info-hash / peer-id.
pub const HASH_LEN: usize = 20;

/// Fixed preamble of the handshake message.
pub const PROTOCOL_NAME: &[u8] = b"BitTorrent protocol";

/// Total length in bytes of the handshake message.
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_NAME.len() + 8 + HASH_LEN + HASH_LEN;
