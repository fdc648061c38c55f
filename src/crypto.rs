use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

pub type Blake2b256 = Blake2b<U32>;

/// Length of a field element as declared by the proving-system backend.
/// Certificate parsing asserts commitment tree roots against this value.
pub const FIELD_ELEMENT_LENGTH: usize = 32;

pub fn blake2b256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn blake2b256_of_slices(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Draws a fresh 32-byte version for storage updates that are not derived
/// from a block id. Downstream stores rely on version uniqueness.
pub fn random_version() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b256_is_deterministic() {
        assert_eq!(blake2b256(b"abc"), blake2b256(b"abc"));
        assert_ne!(blake2b256(b"abc"), blake2b256(b"abd"));
    }

    #[test]
    fn double_sha256_differs_from_single() {
        let data = b"certificate bytes";
        let single: [u8; 32] = Sha256::digest(data).into();
        assert_ne!(double_sha256(data), single);
    }

    #[test]
    fn random_versions_are_unique() {
        assert_ne!(random_version(), random_version());
    }
}
