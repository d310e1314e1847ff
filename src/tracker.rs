//! Synchronous HTTP tracker announce. One blocking GET, one bencoded response, decoded into
//! `{interval, seeders, leechers, peers}` regardless of which of the two peer-list encodings the
//! tracker chose to send.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bencode::{Bencode, BencodeDictValues};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddrV4>,
}

pub struct TrackerClient {
    client: reqwest::blocking::Client,
    tracker_url: String,
}

impl TrackerClient {
    pub fn new(tracker_url: &str) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            tracker_url: tracker_url.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn announce(
        &self,
        url_encoded_info_hash: &str,
        peer_id: &[u8],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Option<Event>,
        numwant: Option<u32>,
    ) -> Result<AnnounceResponse, TrackerError> {
        let peer_id = String::from_utf8_lossy(peer_id).into_owned();
        let mut query_params = vec![
            ("peer_id".to_string(), peer_id),
            ("port".to_string(), port.to_string()),
            ("uploaded".to_string(), uploaded.to_string()),
            ("downloaded".to_string(), downloaded.to_string()),
            ("left".to_string(), left.to_string()),
            ("compact".to_string(), "1".to_string()),
        ];
        if let Some(event) = event {
            query_params.push(("event".to_string(), event.as_str().to_string()));
        }
        if let Some(numwant) = numwant {
            query_params.push(("numwant".to_string(), numwant.to_string()));
        }

        // The info-hash is already percent-encoded byte-for-byte; appending it to the query
        // string directly avoids double-escaping it through `.query()`.
        let request = self
            .client
            .get(format!("{}?info_hash={}", self.tracker_url, url_encoded_info_hash))
            .query(&query_params);

        debug!(url = %self.tracker_url, "sending tracker announce");
        let response = request.send()?.bytes()?;
        parse_announce_response(&response)
    }
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let (value, _) = Bencode::from_bytes(body, |key| match key {
        "peers" => Some(6),
        _ => None,
    })
    .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

    let Bencode::Dict(table) = value else {
        return Err(TrackerError::MalformedResponse(
            "response is not a bencoded dictionary".to_string(),
        ));
    };

    if let Some(BencodeDictValues::Bencode(Bencode::String(reason))) = table.get("failure reason") {
        return Err(TrackerError::MalformedResponse(reason.clone()));
    }

    let interval = match table.get("interval") {
        Some(BencodeDictValues::Bencode(Bencode::Number(n))) => Duration::from_secs((*n).max(0) as u64),
        _ => {
            return Err(TrackerError::MalformedResponse(
                "missing interval".to_string(),
            ))
        }
    };

    let seeders = as_u32(table.get("complete"));
    let leechers = as_u32(table.get("incomplete"));

    let peers = match table.get("peers") {
        Some(BencodeDictValues::Bytes(records)) => parse_compact_peers(records)?,
        Some(BencodeDictValues::Bencode(Bencode::List(entries))) => parse_dict_peers(entries)?,
        _ => return Err(TrackerError::MalformedResponse("missing peers".to_string())),
    };

    Ok(AnnounceResponse {
        interval,
        seeders,
        leechers,
        peers,
    })
}

fn as_u32(value: Option<&BencodeDictValues>) -> Option<u32> {
    match value {
        Some(BencodeDictValues::Bencode(Bencode::Number(n))) => Some((*n).max(0) as u32),
        _ => None,
    }
}

fn parse_compact_peers(records: &[Vec<u8>]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    records
        .iter()
        .map(|record| {
            let bytes: [u8; 6] = record
                .as_slice()
                .try_into()
                .map_err(|_| TrackerError::MalformedResponse("malformed compact peer record".to_string()))?;
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(SocketAddrV4::new(ip, port))
        })
        .collect()
}

fn parse_dict_peers(entries: &[Bencode]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    entries
        .iter()
        .map(|entry| {
            let Bencode::Dict(table) = entry else {
                return Err(TrackerError::MalformedResponse(
                    "peers entry is not a dictionary".to_string(),
                ));
            };
            let ip = match table.get("ip") {
                Some(BencodeDictValues::Bencode(Bencode::String(s))) => s
                    .parse::<Ipv4Addr>()
                    .map_err(|_| TrackerError::MalformedResponse(format!("invalid peer ip {s}")))?,
                _ => return Err(TrackerError::MalformedResponse("peer entry missing ip".to_string())),
            };
            let port = match table.get("port") {
                Some(BencodeDictValues::Bencode(Bencode::Number(n))) => *n as u16,
                _ => return Err(TrackerError::MalformedResponse("peer entry missing port".to_string())),
            };
            Ok(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let body = b"d8:completei3e10:incompletei1e8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x08\x08\x08\x08\x00\x50e";
        let resp = parse_announce_response(body).unwrap();
        assert_eq!(resp.interval, Duration::from_secs(1800));
        assert_eq!(resp.seeders, Some(3));
        assert_eq!(resp.leechers, Some(1));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(resp.peers[1], "8.8.8.8:80".parse().unwrap());
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeeee";
        let resp = parse_announce_response(body).unwrap();
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn surfaces_failure_reason_as_an_error() {
        let body = b"d14:failure reason16:torrent not founde";
        let err = parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::MalformedResponse(msg) if msg == "torrent not found"));
    }
}
