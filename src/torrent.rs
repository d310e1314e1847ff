//! Metainfo files (also known as `.torrent` files) are bencoded dictionaries with an `announce`
//! URL and an `info` sub-dictionary describing the shared file(s) and their per-piece SHA-1
//! digests. Multi-file torrents decode for fidelity with real-world files, but only single-file
//! torrents can drive a download through the swarm loop.

use std::fs;
use std::path::Path;

use bencode::{Bencode, BencodeDictValues};
use indexmap::IndexMap;
use sha1_smol::Sha1;
use thiserror::Error;

use crate::config::HASH_LEN;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("invalid or corrupt metainfo file: {0}")]
    InvalidMetainfo(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bencode error: {0}")]
    Bencode(#[from] Box<dyn std::error::Error>),
}

#[derive(Debug)]
pub struct Torrent {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub info: Info,
}

#[derive(Debug)]
pub struct Info {
    pub file_type: FileType,
    pub name: String,
    pub piece_length: u32,
    pub pieces: Vec<[u8; HASH_LEN]>,
}

#[derive(Debug)]
pub enum FileType {
    MultiFile { files: Vec<File> },
    SingleFile { length: u64 },
}

#[derive(Debug)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl Torrent {
    pub fn from_file(file_path: &Path) -> Result<Self, TorrentError> {
        let buffer = fs::read(file_path)?;
        Self::from_bytes(&buffer)
    }

    pub fn from_bytes(encoded_bytes: &[u8]) -> Result<Self, TorrentError> {
        let (value, _) = Bencode::from_bytes(encoded_bytes, byte_mode_key)
            .map_err(TorrentError::Bencode)?;
        Torrent::try_from(value)
    }
}

fn byte_mode_key(key: &str) -> Option<usize> {
    match key {
        "pieces" => Some(HASH_LEN),
        _ => None,
    }
}

impl TryFrom<Bencode> for Torrent {
    type Error = TorrentError;

    fn try_from(value: Bencode) -> Result<Self, Self::Error> {
        let table = match value {
            Bencode::Dict(table) => table,
            _ => {
                return Err(TorrentError::InvalidMetainfo(
                    "metainfo file must be a bencoded dictionary".to_string(),
                ))
            }
        };

        let announce = get_string(&table, "announce");
        let announce_list = get_announce_list(&table);

        let info = match table.get("info") {
            Some(BencodeDictValues::Bencode(info_value)) => Info::parse(info_value)?,
            _ => {
                return Err(TorrentError::InvalidMetainfo(
                    "info dictionary does not exist".to_string(),
                ))
            }
        };

        Ok(Self {
            announce,
            announce_list,
            info,
        })
    }
}

fn get_string(table: &IndexMap<String, BencodeDictValues>, key: &str) -> Option<String> {
    match table.get(key)? {
        BencodeDictValues::Bencode(Bencode::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_announce_list(table: &IndexMap<String, BencodeDictValues>) -> Vec<Vec<String>> {
    let Some(BencodeDictValues::Bencode(Bencode::List(tiers))) = table.get("announce-list") else {
        return Vec::new();
    };
    tiers
        .iter()
        .filter_map(|tier| match tier {
            Bencode::List(urls) => Some(
                urls.iter()
                    .filter_map(|u| match u {
                        Bencode::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

impl Info {
    /// Re-encode the `info` dictionary exactly as it will be hashed (keys sorted
    /// lexicographically), so the SHA-1 of these bytes is a stable info-hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let file_type_bytes = self.file_type.to_bytes();
        let name_bytes = format!("{}:{}", self.name.len(), self.name).into_bytes();
        let piece_length_bytes = format!("i{}e", self.piece_length).into_bytes();

        let mut res = vec![b'd'];
        res.extend(file_type_bytes);
        res.extend(b"4:name");
        res.extend(name_bytes);
        res.extend(b"12:piece length");
        res.extend(piece_length_bytes);
        res.extend(b"6:pieces");
        res.extend(format!("{}:", self.pieces.len() * HASH_LEN).into_bytes());
        res.extend(self.pieces.iter().flatten());
        res.push(b'e');
        res
    }

    pub fn info_hash(&self) -> [u8; HASH_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(&self.to_bytes());
        hasher.digest().bytes()
    }

    /// The info-hash, percent-encoded byte-for-byte as trackers expect in the `info_hash` query
    /// parameter (not just the non-alphanumeric subset `percent_encode` would leave alone).
    pub fn url_encoded_info_hash(&self) -> String {
        self.info_hash().iter().map(|b| format!("%{:02x}", b)).collect()
    }

    pub fn total_length(&self) -> u64 {
        match &self.file_type {
            FileType::MultiFile { files } => files.iter().map(|f| f.length).sum(),
            FileType::SingleFile { length } => *length,
        }
    }

    fn parse(value: &Bencode) -> Result<Self, TorrentError> {
        let table = match value {
            Bencode::Dict(table) => table,
            _ => {
                return Err(TorrentError::InvalidMetainfo(
                    "info is not a bencoded dictionary".to_string(),
                ))
            }
        };

        let file_type = FileType::parse(table)?;

        let name = get_string(table, "name")
            .ok_or_else(|| TorrentError::InvalidMetainfo("info.name is missing".to_string()))?;

        let piece_length = match table.get("piece length") {
            Some(BencodeDictValues::Bencode(Bencode::Number(n))) => *n as u32,
            _ => {
                return Err(TorrentError::InvalidMetainfo(
                    "info.piece length is missing".to_string(),
                ))
            }
        };

        let pieces = match table.get("pieces") {
            Some(BencodeDictValues::Bytes(chunks)) => chunks
                .iter()
                .map(|chunk| {
                    <[u8; HASH_LEN]>::try_from(chunk.as_slice())
                        .map_err(|_| TorrentError::InvalidMetainfo("malformed piece hash".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(TorrentError::InvalidMetainfo("info.pieces is missing".to_string())),
        };

        Ok(Self {
            file_type,
            name,
            piece_length,
            pieces,
        })
    }
}

impl FileType {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            FileType::MultiFile { files } => {
                let mut out = vec![b'l'];
                for file in files {
                    out.extend(format!("6:lengthi{}e", file.length).into_bytes());
                    for segment in &file.path {
                        out.extend(format!("4:path{}:{}", segment.len(), segment).into_bytes());
                    }
                }
                out.push(b'e');
                out
            }
            FileType::SingleFile { length } => format!("6:lengthi{}e", length).into_bytes(),
        }
    }

    fn parse(table: &IndexMap<String, BencodeDictValues>) -> Result<Self, TorrentError> {
        if let Some(BencodeDictValues::Bencode(Bencode::Number(n))) = table.get("length") {
            return Ok(FileType::SingleFile { length: *n as u64 });
        }
        if let Some(BencodeDictValues::Bencode(Bencode::List(entries))) = table.get("files") {
            let files = entries.iter().map(parse_file_entry).collect::<Result<Vec<_>, _>>()?;
            return Ok(FileType::MultiFile { files });
        }
        Err(TorrentError::InvalidMetainfo(
            "info has neither length nor files".to_string(),
        ))
    }
}

fn parse_file_entry(entry: &Bencode) -> Result<File, TorrentError> {
    let table = match entry {
        Bencode::Dict(table) => table,
        _ => {
            return Err(TorrentError::InvalidMetainfo(
                "files entry is not a dictionary".to_string(),
            ))
        }
    };
    let length = match table.get("length") {
        Some(BencodeDictValues::Bencode(Bencode::Number(n))) => *n as u64,
        _ => return Err(TorrentError::InvalidMetainfo("file entry missing length".to_string())),
    };
    let path = match table.get("path") {
        Some(BencodeDictValues::Bencode(Bencode::List(segments))) => segments
            .iter()
            .map(|s| match s {
                Bencode::String(s) => Ok(s.clone()),
                _ => Err(TorrentError::InvalidMetainfo("path segment is not a string".to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(TorrentError::InvalidMetainfo("file entry missing path".to_string())),
    };
    Ok(File { length, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        let pieces = "aaaaaaaaaaaaaaaaaaaa";
        format!(
            "d8:announce20:http://tracker.test/4:infod6:lengthi32e4:name4:data12:piece lengthi16e6:pieces{}:{}ee",
            pieces.len(),
            pieces
        )
        .into_bytes()
    }

    #[test]
    fn parses_single_file_torrent() {
        let torrent = Torrent::from_bytes(&sample_bytes()).unwrap();
        assert_eq!(torrent.announce.as_deref(), Some("http://tracker.test/"));
        assert_eq!(torrent.info.name, "data");
        assert_eq!(torrent.info.piece_length, 16);
        assert_eq!(torrent.info.total_length(), 32);
        assert_eq!(torrent.info.pieces.len(), 1);
    }

    #[test]
    fn info_hash_is_stable_across_reparse() {
        let a = Torrent::from_bytes(&sample_bytes()).unwrap();
        let b = Torrent::from_bytes(&sample_bytes()).unwrap();
        assert_eq!(a.info.info_hash(), b.info.info_hash());
    }

    #[test]
    fn rejects_missing_info_dictionary() {
        let err = Torrent::from_bytes(b"d8:announce3:fooe").unwrap_err();
        assert!(matches!(err, TorrentError::InvalidMetainfo(_) | TorrentError::Bencode(_)));
    }
}
