use std::net::SocketAddrV4;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Decode a raw bencode blob passed on the command line and print its structure.
    Decode { bencode: String },
    /// Decode a `.torrent` file and print its metadata and info-hash.
    Info {
        file: PathBuf,
        #[arg(long, short = 'p')]
        peer_discovery: bool,
    },
    /// Download the content described by a `.torrent` file.
    Download {
        file: PathBuf,
        /// Destination path for the downloaded content.
        destination: PathBuf,
        /// Local TCP port to listen on (currently informational; only outbound connections are
        /// made).
        #[arg(long, default_value_t = 6881)]
        port: u16,
        /// Connect directly to this peer instead of announcing to the tracker. Useful for
        /// testing against a single known seeder.
        #[arg(long)]
        peer: Option<SocketAddrV4>,
    },
}
