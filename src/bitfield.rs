//! Dense bitset used for piece completion, per-peer availability and per-piece block progress.
//!
//! Built on top of [`bit_vec::BitVec`], which already packs bits big-endian (MSB first) per
//! byte and zero-pads trailing bits on [`BitVec::to_bytes`] — exactly the wire encoding the
//! swarm protocol's `bitfield` message uses.

use bit_vec::BitVec;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec,
}

impl Bitfield {
    /// A bitfield of `len` bits, all clear.
    pub fn zeros(len: usize) -> Self {
        Bitfield {
            bits: BitVec::from_elem(len, false),
        }
    }

    /// Decode a packed, big-endian-bit-order byte string into a bitfield of `bytes.len() * 8`
    /// bits. Callers that only care about a logical prefix (e.g. `num_pieces` pieces) must
    /// ignore indices at or beyond that prefix themselves; trailing pad bits are not assumed
    /// to be zero on a value we did not produce ourselves.
    pub fn from_packed_bytes(bytes: &[u8]) -> Self {
        Bitfield {
            bits: BitVec::from_bytes(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// This bitfield's first `len` bits, zero-extended or truncated as needed. Used to clamp a
    /// peer-supplied `bitfield` message (which is zero-padded to a whole number of bytes) down
    /// to the true piece count, so `len()` always reflects `num_pieces` rather than the padded
    /// wire width.
    pub fn truncated(&self, len: usize) -> Self {
        let mut out = Bitfield::zeros(len);
        for i in 0..len.min(self.len()) {
            if self.get(i) {
                out.set(i);
            }
        }
        out
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| *b).count()
    }

    pub fn find_first_set(&self) -> Option<usize> {
        self.bits.iter().position(|b| b)
    }

    pub fn find_first_unset(&self) -> Option<usize> {
        self.bits.iter().position(|b| !b)
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }

    /// Big-endian-bit-order packed bytes, zero-padded to a whole number of bytes. This is the
    /// exact encoding `BitVec::to_bytes` produces.
    pub fn to_packed_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// `self AND NOT other`, truncated to the shorter of the two lengths.
    pub fn and_not(&self, other: &Bitfield) -> Bitfield {
        let len = self.len().min(other.len());
        let mut result = Bitfield::zeros(len);
        for i in 0..len {
            if self.get(i) && !other.get(i) {
                result.set(i);
            }
        }
        result
    }

    /// Uniformly-random set bit, via rejection sampling — avoids materializing the index list
    /// of a potentially large, sparse bitset.
    pub fn random_set_bit<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        random_bit_matching(self, rng, true)
    }

    /// Uniformly-random clear bit, via rejection sampling.
    pub fn random_unset_bit<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        random_bit_matching(self, rng, false)
    }
}

fn random_bit_matching<R: Rng + ?Sized>(bf: &Bitfield, rng: &mut R, want: bool) -> Option<usize> {
    if bf.is_empty() {
        return None;
    }
    let matching = bf.iter_set().count();
    let matching = if want { matching } else { bf.len() - matching };
    if matching == 0 {
        return None;
    }
    // Rejection sampling: cheap when the bitset isn't close to all-one-value, and bounded
    // above by a linear scan fallback so a pathological caller can't spin forever.
    for _ in 0..(bf.len() * 4).max(64) {
        let idx = rng.gen_range(0..bf.len());
        if bf.get(idx) == want {
            return Some(idx);
        }
    }
    (0..bf.len()).find(|&i| bf.get(i) == want)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn packs_big_endian_bit_order_with_zero_padding() {
        let mut bf = Bitfield::zeros(9);
        bf.set(0);
        bf.set(8);
        let bytes = bf.to_packed_bytes();
        assert_eq!(bytes, vec![0b1000_0000, 0b1000_0000]);
    }

    #[test]
    fn truncated_drops_wire_padding_bits() {
        // 10 pieces packs to 2 bytes (16 bits); truncating back to 10 must drop the 6 pad bits.
        let mut bf = Bitfield::zeros(10);
        bf.set(9);
        let packed = bf.to_packed_bytes();
        let decoded = Bitfield::from_packed_bytes(&packed).truncated(10);
        assert_eq!(decoded.len(), 10);
        assert!(decoded.get(9));
    }

    #[test]
    fn round_trips_through_packed_bytes() {
        let mut bf = Bitfield::zeros(10);
        bf.set(1);
        bf.set(9);
        let decoded = Bitfield::from_packed_bytes(&bf.to_packed_bytes());
        assert!(decoded.get(1));
        assert!(decoded.get(9));
        assert!(!decoded.get(0));
    }

    #[test]
    fn find_first_set_and_unset() {
        let mut bf = Bitfield::zeros(4);
        assert_eq!(bf.find_first_set(), None);
        assert_eq!(bf.find_first_unset(), Some(0));
        bf.set(2);
        assert_eq!(bf.find_first_set(), Some(2));
    }

    #[test]
    fn and_not_computes_wanted_pieces() {
        let mut have = Bitfield::zeros(4);
        have.set(0);
        let mut peer_has = Bitfield::zeros(4);
        peer_has.set(0);
        peer_has.set(2);
        let want = peer_has.and_not(&have);
        assert!(!want.get(0));
        assert!(want.get(2));
        assert_eq!(want.count(), 1);
    }

    #[test]
    fn random_set_bit_only_returns_set_indices() {
        let mut bf = Bitfield::zeros(16);
        bf.set(5);
        let mut rng = thread_rng();
        assert_eq!(bf.random_set_bit(&mut rng), Some(5));
        assert_eq!(bf.random_unset_bit(&mut rng).map(|i| i != 5), Some(true));
    }
}
