//! Memory-mapped content buffer, sliced into hash-verified pieces and `BLOCKSIZE`-aligned
//! blocks.
//!
//! The backing region is memory-mapped via [`memmap2`] wherever possible; when mapping fails
//! (a zero-length file, an unusual filesystem, a platform error) the store falls back to
//! positional `pread`/`pwrite` against the open file handle. [`PieceStore::read_block`] exposes
//! both cases through [`BlockView`], which derefs to `&[u8]` either way.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::ops::Deref;
use std::path::Path;

use memmap2::MmapMut;
use sha1_smol::Sha1;
use thiserror::Error;

use crate::bitfield::Bitfield;
use crate::config::{BLOCKSIZE, HASH_LEN};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pieces hash table has {actual} bytes, expected {expected}")]
    HashTableLength { expected: usize, actual: usize },
    #[error("piece index {0} out of range")]
    PieceOutOfRange(usize),
    #[error("piece {0} is already verified; writes are forbidden")]
    PieceAlreadyVerified(usize),
    #[error("piece {0} is not yet verified; reads are forbidden")]
    PieceNotVerified(usize),
    #[error("begin {begin} is not aligned to the block size")]
    UnalignedBegin { begin: u32 },
    #[error("block length mismatch: expected {expected}, got {actual}")]
    BlockLengthMismatch { expected: u32, actual: u32 },
    #[error("read out of bounds: begin {begin} + length {length} exceeds piece size {size}")]
    ReadOutOfBounds { begin: u32, length: u32, size: u32 },
}

/// A borrowed slice when the backing region is mapped, or an owned copy when it was read
/// positionally. Either way it derefs to the requested bytes.
pub enum BlockView<'a> {
    Mapped(&'a [u8]),
    Owned(Vec<u8>),
}

impl Deref for BlockView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlockView::Mapped(s) => s,
            BlockView::Owned(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Piece {
    pub offset: u64,
    pub size: u32,
    pub hash: [u8; HASH_LEN],
    pub verified: bool,
    block_progress: Option<Bitfield>,
}

impl Piece {
    pub fn num_blocks(&self) -> usize {
        self.size.div_ceil(BLOCKSIZE) as usize
    }

    /// Length in bytes of block `block_idx`: `BLOCKSIZE` for every block but possibly the last.
    pub fn block_len(&self, block_idx: usize) -> u32 {
        let num_blocks = self.num_blocks();
        if block_idx + 1 == num_blocks {
            self.size - (num_blocks as u32 - 1) * BLOCKSIZE
        } else {
            BLOCKSIZE
        }
    }

    pub fn block_progress(&self) -> Option<&Bitfield> {
        self.block_progress.as_ref()
    }
}

enum Backing {
    Mapped(MmapMut),
    File(File),
}

pub struct PieceStore {
    backing: Backing,
    pieces: Vec<Piece>,
    verified_bits: Bitfield,
}

impl PieceStore {
    /// Create or open `path`, truncate it to `filesize`, and construct the piece sequence
    /// described by `piece_size` and the concatenated 20-byte `pieces_hashes` table.
    pub fn open(
        path: &Path,
        filesize: u64,
        piece_size: u32,
        pieces_hashes: &[u8],
    ) -> Result<Self, StoreError> {
        let num_pieces = filesize.div_ceil(piece_size as u64) as usize;
        let expected_len = num_pieces * HASH_LEN;
        if pieces_hashes.len() != expected_len {
            return Err(StoreError::HashTableLength {
                expected: expected_len,
                actual: pieces_hashes.len(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(filesize)?;

        let backing = if filesize == 0 {
            Backing::File(file)
        } else {
            match unsafe { memmap2::MmapOptions::new().len(filesize as usize).map_mut(&file) } {
                Ok(mmap) => Backing::Mapped(mmap),
                Err(_) => Backing::File(file),
            }
        };

        let mut pieces = Vec::with_capacity(num_pieces);
        for index in 0..num_pieces {
            let offset = index as u64 * piece_size as u64;
            let last = index + 1 == num_pieces;
            let remainder = filesize % piece_size as u64;
            let size = if last && remainder != 0 {
                remainder as u32
            } else {
                piece_size
            };
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&pieces_hashes[index * HASH_LEN..(index + 1) * HASH_LEN]);
            let num_blocks = size.div_ceil(BLOCKSIZE) as usize;
            pieces.push(Piece {
                offset,
                size,
                hash,
                verified: false,
                block_progress: Some(Bitfield::zeros(num_blocks)),
            });
        }

        Ok(PieceStore {
            backing,
            pieces,
            verified_bits: Bitfield::zeros(num_pieces),
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: usize) -> Option<&Piece> {
        self.pieces.get(index)
    }

    /// Write `block` at `begin` within `piece_index`, then verify the piece if that was its
    /// last missing block.
    pub fn store_block(
        &mut self,
        piece_index: usize,
        begin: u32,
        block: &[u8],
    ) -> Result<(), StoreError> {
        let piece = self
            .pieces
            .get(piece_index)
            .ok_or(StoreError::PieceOutOfRange(piece_index))?;
        if piece.verified {
            return Err(StoreError::PieceAlreadyVerified(piece_index));
        }
        if begin % BLOCKSIZE != 0 {
            return Err(StoreError::UnalignedBegin { begin });
        }
        let block_idx = (begin / BLOCKSIZE) as usize;
        let expected_len = piece.block_len(block_idx);
        if block.len() as u32 != expected_len {
            return Err(StoreError::BlockLengthMismatch {
                expected: expected_len,
                actual: block.len() as u32,
            });
        }
        let offset = piece.offset + begin as u64;
        let num_blocks = piece.num_blocks();

        self.write_region(offset, block)?;

        let piece = &mut self.pieces[piece_index];
        let full = {
            let bp = piece.block_progress.as_mut().expect("unverified piece has progress bits");
            bp.set(block_idx);
            bp.count() == num_blocks
        };
        if full {
            self.verify(piece_index)?;
        }
        Ok(())
    }

    /// Recompute the SHA-1 of the piece's backing bytes and compare against its declared
    /// digest. On success the piece is marked verified and its progress bits discarded; on
    /// failure `block_progress` is reset to all-false so the piece can be refilled.
    pub fn verify(&mut self, piece_index: usize) -> Result<bool, StoreError> {
        let piece = self
            .pieces
            .get(piece_index)
            .ok_or(StoreError::PieceOutOfRange(piece_index))?;
        let offset = piece.offset;
        let size = piece.size;
        let expected_hash = piece.hash;

        let bytes = self.read_region(offset, size as usize)?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let actual_hash = hasher.digest().bytes();
        let matched = actual_hash == expected_hash;

        let piece = &mut self.pieces[piece_index];
        if matched {
            piece.verified = true;
            piece.block_progress = None;
            self.verified_bits.set(piece_index);
            // Best-effort: a flush failure (or an alignment error on an odd-sized mapping) is
            // silently ignored per policy.
            let _ = self.flush_region(offset, size as usize);
        } else {
            piece.verified = false;
            piece.block_progress = Some(Bitfield::zeros(piece.num_blocks()));
            self.verified_bits.clear(piece_index);
        }
        Ok(matched)
    }

    /// Read `length` bytes at `begin` within a verified piece.
    pub fn read_block(
        &self,
        piece_index: usize,
        begin: u32,
        length: u32,
    ) -> Result<BlockView<'_>, StoreError> {
        let piece = self
            .pieces
            .get(piece_index)
            .ok_or(StoreError::PieceOutOfRange(piece_index))?;
        if !piece.verified {
            return Err(StoreError::PieceNotVerified(piece_index));
        }
        if begin + length > piece.size {
            return Err(StoreError::ReadOutOfBounds {
                begin,
                length,
                size: piece.size,
            });
        }
        Ok(self.read_view(piece.offset + begin as u64, length as usize)?)
    }

    /// Byte-packed bitfield, big-endian bit order, zero-padded to a whole number of bytes: bit
    /// `i` set iff piece `i` is verified.
    pub fn bitfield(&self) -> Vec<u8> {
        self.verified_bits.to_packed_bytes()
    }

    pub fn verified_bitset(&self) -> &Bitfield {
        &self.verified_bits
    }

    pub fn is_complete(&self) -> bool {
        self.verified_bits.count() == self.pieces.len()
    }

    /// Re-verify every piece against its digest. There is no sidecar or resume index, so this
    /// is how a restarted client recovers its completion bitfield.
    pub fn recover(&mut self) -> Result<(), StoreError> {
        for index in 0..self.pieces.len() {
            self.verify(index)?;
        }
        Ok(())
    }

    fn write_region(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        match &mut self.backing {
            Backing::Mapped(mmap) => {
                let start = offset as usize;
                mmap[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Backing::File(file) => file.write_all_at(data, offset),
        }
    }

    fn read_region(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        match &self.backing {
            Backing::Mapped(mmap) => {
                let start = offset as usize;
                Ok(mmap[start..start + len].to_vec())
            }
            Backing::File(file) => {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }

    fn read_view(&self, offset: u64, len: usize) -> std::io::Result<BlockView<'_>> {
        match &self.backing {
            Backing::Mapped(mmap) => {
                let start = offset as usize;
                Ok(BlockView::Mapped(&mmap[start..start + len]))
            }
            Backing::File(file) => {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset)?;
                Ok(BlockView::Owned(buf))
            }
        }
    }

    fn flush_region(&self, offset: u64, len: usize) -> std::io::Result<()> {
        match &self.backing {
            Backing::Mapped(mmap) => mmap.flush_range(offset as usize, len),
            Backing::File(file) => file.sync_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1_smol::Sha1;
    use tempfile::NamedTempFile;

    fn digest_of(bytes: &[u8]) -> [u8; HASH_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.digest().bytes()
    }

    #[test]
    fn store_and_verify_whole_piece() {
        let tmp = NamedTempFile::new().unwrap();
        let zeros = vec![0u8; 32];
        let hash = digest_of(&zeros);

        let mut store = PieceStore::open(tmp.path(), 32, 32, &hash).unwrap();
        store.store_block(0, 0, &[0u8; 16]).unwrap();
        assert!(!store.piece(0).unwrap().verified);
        store.store_block(0, 16, &[0u8; 16]).unwrap();

        assert!(store.piece(0).unwrap().verified);
        assert_eq!(store.bitfield(), vec![0b1000_0000]);
    }

    #[test]
    fn hash_mismatch_resets_progress_without_verifying() {
        let tmp = NamedTempFile::new().unwrap();
        let hash = digest_of(&[0u8; 32]);

        let mut store = PieceStore::open(tmp.path(), 32, 32, &hash).unwrap();
        store.store_block(0, 0, &[0u8; 16]).unwrap();
        store.store_block(0, 16, &[0xffu8; 16]).unwrap();

        assert!(!store.piece(0).unwrap().verified);
        let progress = store.piece(0).unwrap().block_progress().unwrap();
        assert_eq!(progress.count(), 0);
    }

    #[test]
    fn reads_from_unverified_piece_are_forbidden() {
        let tmp = NamedTempFile::new().unwrap();
        let hash = digest_of(&[0u8; 32]);
        let store = PieceStore::open(tmp.path(), 32, 32, &hash).unwrap();
        assert!(matches!(
            store.read_block(0, 0, 16),
            Err(StoreError::PieceNotVerified(0))
        ));
    }

    #[test]
    fn writes_to_verified_piece_are_forbidden() {
        let tmp = NamedTempFile::new().unwrap();
        let hash = digest_of(&[0u8; 16]);
        let mut store = PieceStore::open(tmp.path(), 16, 16, &hash).unwrap();
        store.store_block(0, 0, &[0u8; 16]).unwrap();
        assert!(store.piece(0).unwrap().verified);
        assert!(matches!(
            store.store_block(0, 0, &[0u8; 16]),
            Err(StoreError::PieceAlreadyVerified(0))
        ));
    }

    #[test]
    fn last_piece_is_truncated() {
        let tmp = NamedTempFile::new().unwrap();
        // filesize 40, piece_size 32 -> two pieces, second of size 8.
        let hashes = vec![0u8; 40];
        let store = PieceStore::open(tmp.path(), 40, 32, &hashes).unwrap();
        assert_eq!(store.num_pieces(), 2);
        assert_eq!(store.piece(1).unwrap().size, 8);
        assert_eq!(store.piece(1).unwrap().num_blocks(), 1);
    }

    #[test]
    fn rejects_mismatched_hash_table_length() {
        let tmp = NamedTempFile::new().unwrap();
        let err = PieceStore::open(tmp.path(), 32, 32, &[0u8; 19]).unwrap_err();
        assert!(matches!(err, StoreError::HashTableLength { .. }));
    }

    #[test]
    fn recover_re_verifies_existing_content() {
        let tmp = NamedTempFile::new().unwrap();
        let hash = digest_of(&[0u8; 16]);
        {
            let mut store = PieceStore::open(tmp.path(), 16, 16, &hash).unwrap();
            store.store_block(0, 0, &[0u8; 16]).unwrap();
        }
        let mut reopened = PieceStore::open(tmp.path(), 16, 16, &hash).unwrap();
        assert!(!reopened.piece(0).unwrap().verified);
        reopened.recover().unwrap();
        assert!(reopened.piece(0).unwrap().verified);
    }
}
