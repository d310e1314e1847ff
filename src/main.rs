mod arg_parse;

use std::net::SocketAddrV4;

use bencode::Bencode;
use bittide::error::BittideError;
use bittide::peer_id;
use bittide::piece_store::PieceStore;
use bittide::swarm::{Swarm, UniformRandomSelector};
use bittide::torrent::Torrent;
use bittide::tracker::{Event, TrackerClient};
use clap::Parser;
use tracing::info;

fn main() -> Result<(), BittideError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = arg_parse::Cli::parse();
    match cli.action {
        arg_parse::Action::Decode { bencode } => decode(&bencode),
        arg_parse::Action::Info { file, peer_discovery: _ } => info_cmd(&file),
        arg_parse::Action::Download { file, destination, port, peer } => {
            download(&file, &destination, port, peer)
        }
    }
}

fn decode(bencode: &str) -> Result<(), BittideError> {
    let (value, _) = Bencode::from_bytes(bencode.as_bytes(), |key| match key {
        "pieces" => Some(20),
        _ => None,
    })
    .map_err(BittideError::Bencode)?;
    println!("{:?}", value);
    Ok(())
}

fn info_cmd(file: &std::path::Path) -> Result<(), BittideError> {
    let torrent = Torrent::from_file(file)?;
    println!("name: {}", torrent.info.name);
    println!("announce: {:?}", torrent.announce);
    println!("piece length: {}", torrent.info.piece_length);
    println!("pieces: {}", torrent.info.pieces.len());
    println!("total length: {}", torrent.info.total_length());
    println!("info hash: {}", hex::encode(torrent.info.info_hash()));
    Ok(())
}

fn download(
    file: &std::path::Path,
    destination: &std::path::Path,
    port: u16,
    fixed_peer: Option<SocketAddrV4>,
) -> Result<(), BittideError> {
    let torrent = Torrent::from_file(file)?;
    let info_hash = torrent.info.info_hash();
    let our_peer_id = peer_id::generate_peer_id();

    let mut store = PieceStore::open(
        destination,
        torrent.info.total_length(),
        torrent.info.piece_length,
        &torrent.info.pieces.iter().flatten().copied().collect::<Vec<u8>>(),
    )?;
    if let Err(e) = store.recover() {
        tracing::warn!(error = %e, "failed to recover piece verification state");
    }

    let mut swarm = Swarm::new(store, UniformRandomSelector::new(), info_hash, our_peer_id)?;

    let peer_addresses = match fixed_peer {
        Some(addr) => vec![addr],
        None => {
            let announce_url = torrent
                .announce
                .as_deref()
                .ok_or_else(|| BittideError::Other("torrent has no announce URL".to_string()))?;
            let client = TrackerClient::new(announce_url);
            let response = client.announce(
                &torrent.info.url_encoded_info_hash(),
                &our_peer_id,
                port,
                0,
                0,
                torrent.info.total_length(),
                Some(Event::Started),
                Some(50),
            )?;
            info!(peers = response.peers.len(), interval = ?response.interval, "tracker announce succeeded");
            response.peers
        }
    };

    for address in peer_addresses {
        if let Err(e) = swarm.connect(address) {
            info!(%address, error = %e, "failed to connect to peer");
        }
    }

    swarm.run()?;
    Ok(())
}
