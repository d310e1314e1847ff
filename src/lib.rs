pub mod bitfield;
pub mod config;
pub mod error;
pub mod framer;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod peer_id;
pub mod piece_store;
pub mod swarm;
pub mod torrent;
pub mod tracker;
