//! Top-level error type composing every collaborator's error enum, so `main` can surface one
//! `Result` regardless of which stage of startup failed.

use thiserror::Error;

use crate::piece_store::StoreError;
use crate::swarm::SwarmError;
use crate::torrent::TorrentError;
use crate::tracker::TrackerError;

#[derive(Debug, Error)]
pub enum BittideError {
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Bencode(#[from] Box<dyn std::error::Error>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}
