//! Client peer-id generation: `-XX0000-` followed by 12 random alphanumeric characters.

use rand::Rng;

use crate::config::HASH_LEN;

/// Two-ASCII-character client identifier embedded in every generated peer-id.
const CLIENT_TAG: &[u8; 2] = b"BT";

pub fn generate_peer_id() -> [u8; HASH_LEN] {
    generate_peer_id_with(&mut rand::thread_rng())
}

pub fn generate_peer_id_with<R: Rng + ?Sized>(rng: &mut R) -> [u8; HASH_LEN] {
    let mut id = [0u8; HASH_LEN];
    id[0] = b'-';
    id[1] = CLIENT_TAG[0];
    id[2] = CLIENT_TAG[1];
    id[3..7].copy_from_slice(b"0000");
    id[7] = b'-';

    const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    for slot in &mut id[8..20] {
        *slot = ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())];
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn has_fixed_prefix_and_alphanumeric_suffix() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = generate_peer_id_with(&mut rng);
        assert_eq!(&id[0..8], b"-BT0000-");
        assert!(id[8..20].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn is_not_deterministic_across_calls() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_ne!(a, b);
    }
}
