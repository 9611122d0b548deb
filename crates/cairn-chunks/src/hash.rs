//! Content identifiers for chunks, file contents, and encoded directories
//!
//! An identifier is the lowercase hex digest of the bytes. Both supported
//! algorithms produce 32-byte digests, so identifiers are always 64 chars and
//! compare correctly as plain strings.

use cairn_core::config::HashAlgorithm;
use sha2::Digest;

/// Length of a hex-encoded content identifier
pub const CONTENT_ID_LEN: usize = 64;

/// Stateless hasher for one configured algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hasher {
    algorithm: HashAlgorithm,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash a byte slice in memory.
    pub fn digest(&self, data: &[u8]) -> String {
        let mut h = self.streaming();
        h.update(data);
        h.finalize()
    }

    /// Incremental hasher for content that arrives piecewise.
    pub fn streaming(&self) -> ContentHasher {
        match self.algorithm {
            HashAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => ContentHasher::Sha256(sha2::Sha256::new()),
        }
    }
}

/// Streaming hasher. Feeding the chunks of a file in order yields the same
/// identifier as hashing the whole file at once.
pub enum ContentHasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Blake3(h) => {
                h.update(data);
            }
            ContentHasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            ContentHasher::Blake3(h) => h.finalize().to_hex().to_string(),
            ContentHasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// True if `id` looks like a content identifier (64 lowercase hex chars).
///
/// Identifiers become storage keys, so anything else is rejected before it
/// gets near a path.
pub fn is_content_id(id: &str) -> bool {
    id.len() == CONTENT_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
