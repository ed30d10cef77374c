//! Abstractions over hash digests, e.g. of transaction contents.
//!
//! The concrete hash implementation is selected with a feature flag;
//! only a SHA-256 backend over `ring` is currently available.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use ring_sha2::{digest, double_digest, Digest};

#[cfg(not(feature = "crypto_hash_ring_sha2"))]
compile_error!("Please enable one hash backend feature (e.g. crypto_hash_ring_sha2).");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_length() {
        let d = digest(b"123");
        assert_eq!(Digest::LENGTH, d.as_ref().len());
    }

    #[test]
    fn test_double_digest_differs_from_single() {
        let single = digest(b"123");
        let double = double_digest(b"123");
        assert_ne!(single, double);
        assert_eq!(digest(single.as_ref()), double);
    }

    #[test]
    fn test_from_bytes_rejects_short_input() {
        assert!(Digest::from_bytes(&[0; 8]).is_err());
    }

    #[test]
    fn test_display_is_hex() {
        let d = Digest::from_bytes(&[0xab; 32]).unwrap();
        assert!(format!("{}", d).starts_with("abab"));
    }
}
