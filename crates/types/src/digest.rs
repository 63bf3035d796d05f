//! Opaque digest values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque byte string produced by the host's hashing collaborator.
///
/// The core never hashes; it only carries digests around, compares them for
/// bit-equality, and uses them as map keys. Checkpoint values are digests of
/// the application state and use the same representation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn new(bytes: Vec<u8>) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable bucket assignment for a digest: the first eight bytes,
    /// little-endian, modulo the bucket count. Deterministic across replicas.
    pub fn bucket(&self, number_of_buckets: u64) -> u64 {
        let mut prefix = [0u8; 8];
        for (i, b) in self.0.iter().take(8).enumerate() {
            prefix[i] = *b;
        }
        u64::from_le_bytes(prefix) % number_of_buckets
    }
}

impl From<&[u8]> for Digest {
    fn from(bytes: &[u8]) -> Self {
        Digest(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Digest {
    fn from(bytes: Vec<u8>) -> Self {
        Digest(bytes)
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Digest(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printable digests (as used in tests) render as text, real ones as hex.
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b'-') && !self.0.is_empty() {
            write!(f, "Digest({})", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "Digest(")?;
            for b in self.0.iter().take(8) {
                write!(f, "{b:02x}")?;
            }
            if self.0.len() > 8 {
                write!(f, "..")?;
            }
            write!(f, ")")
        }
    }
}
