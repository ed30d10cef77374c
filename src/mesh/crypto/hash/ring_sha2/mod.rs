use std::fmt;

use ring::digest::{digest as ring_digest, SHA256, SHA256_OUTPUT_LEN};

use crate::mesh::error::*;

/// A 32-byte digest identifying a transaction, block or message
/// on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    /// The length of the `Digest` in bytes.
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// Constructs a `Digest` from a byte slice with at
    /// least `Digest::LENGTH` bytes.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHashRingSha2);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }

    /// Returns the inner byte array of this `Digest`.
    pub fn into_inner(self) -> [u8; Self::LENGTH] {
        self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(fmt, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Digest({})", self)
    }
}

/// Hashes a byte slice into a `Digest`.
pub fn digest(data: &[u8]) -> Digest {
    let d = ring_digest(&SHA256, data);
    // the digest is guaranteed to have SHA256_OUTPUT_LEN bytes
    Digest::from_bytes(d.as_ref()).unwrap()
}

/// Hashes a byte slice twice, as blockchain object
/// identifiers commonly are.
pub fn double_digest(data: &[u8]) -> Digest {
    let first = ring_digest(&SHA256, data);
    let second = ring_digest(&SHA256, first.as_ref());
    Digest::from_bytes(second.as_ref()).unwrap()
}
