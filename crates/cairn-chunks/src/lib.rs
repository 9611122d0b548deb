//! cairn-chunks: content-defined chunking and content hashing
//!
//! # Overview
//! - `hash`: content identifiers (BLAKE3 or SHA-256, lowercase hex)
//! - `fastcdc`: content-defined chunking, boundaries stable under inserts

pub mod fastcdc;
pub mod hash;

// Convenience re-exports for the most common operations
pub use fastcdc::{chunk_data, Chunk, ChunkSizes, ChunkStream};
pub use hash::{is_content_id, ContentHasher, Hasher};
