//! FastCDC content-defined chunking
//!
//! Splits files into variable-size chunks whose boundaries are content-defined,
//! ensuring stable chunk boundaries even when data shifts (e.g. inserting bytes
//! near the start of a file doesn't invalidate all subsequent chunks).
//!
//! Minimum and maximum sizes bound fragmentation: an all-zero file produces
//! max-size chunks, never one chunk per byte.
//!
//! Each chunk is content-addressed by its hash.

use std::io::Read;
use std::path::PathBuf;

use cairn_core::config::ChunkConfig;
use cairn_core::{CairnError, CairnResult};

use crate::hash::Hasher;

/// A single content-defined chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the source file
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
    /// Content identifier of this chunk's data
    pub hash: String,
    /// The chunk bytes
    pub data: Vec<u8>,
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkSizes {
    /// Small-file optimized
    pub const SMALL: ChunkSizes = ChunkSizes {
        min_size: 2 * 1024,  // 2KB
        avg_size: 4 * 1024,  // 4KB
        max_size: 16 * 1024, // 16KB
    };

    /// General purpose backups
    pub const DEFAULT: ChunkSizes = ChunkSizes {
        min_size: 16 * 1024,  // 16KB
        avg_size: 64 * 1024,  // 64KB
        max_size: 256 * 1024, // 256KB
    };

    /// For pack/binary files (reduced overhead for large sequential data)
    pub const PACK: ChunkSizes = ChunkSizes {
        min_size: 32 * 1024,  // 32KB
        avg_size: 64 * 1024,  // 64KB
        max_size: 256 * 1024, // 256KB
    };

    /// Validate against the bounds FastCDC accepts. FastCDC panics on
    /// out-of-range sizes, so this runs before any chunker is constructed.
    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> CairnResult<Self> {
        use fastcdc::v2020::{
            AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
        };

        let in_range = (MINIMUM_MIN..=MINIMUM_MAX).contains(&min_size)
            && (AVERAGE_MIN..=AVERAGE_MAX).contains(&avg_size)
            && (MAXIMUM_MIN..=MAXIMUM_MAX).contains(&max_size);
        if !in_range || min_size > avg_size || avg_size > max_size {
            return Err(CairnError::Config(format!(
                "invalid chunk sizes min={min_size} avg={avg_size} max={max_size} \
                 (need {MINIMUM_MIN}..={MINIMUM_MAX}, {AVERAGE_MIN}..={AVERAGE_MAX}, \
                 {MAXIMUM_MIN}..={MAXIMUM_MAX}, min <= avg <= max)"
            )));
        }
        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }
}

impl TryFrom<&ChunkConfig> for ChunkSizes {
    type Error = CairnError;

    fn try_from(cfg: &ChunkConfig) -> CairnResult<Self> {
        ChunkSizes::new(cfg.min_size, cfg.avg_size, cfg.max_size)
    }
}

/// Lazy chunk sequence over a byte stream.
///
/// Reading is pulled by iteration, so at most one `max_size` chunk is held
/// at a time. Re-chunking the same bytes with the same sizes yields the same
/// boundaries. A read error ends the stream with `SourceRead`; no retry.
pub struct ChunkStream<R: Read> {
    inner: fastcdc::v2020::StreamCDC<R>,
    hasher: Hasher,
    path: PathBuf,
    failed: bool,
}

impl<R: Read> ChunkStream<R> {
    /// `path` is only used to label read errors.
    pub fn new(source: R, sizes: ChunkSizes, hasher: Hasher, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: fastcdc::v2020::StreamCDC::new(
                source,
                sizes.min_size,
                sizes.avg_size,
                sizes.max_size,
            ),
            hasher,
            path: path.into(),
            failed: false,
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = CairnResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(c) => Some(Ok(Chunk {
                offset: c.offset,
                length: c.length,
                hash: self.hasher.digest(&c.data),
                data: c.data,
            })),
            Err(e) => {
                self.failed = true;
                let source = match e {
                    fastcdc::v2020::Error::IoError(io) => io,
                    other => std::io::Error::other(other.to_string()),
                };
                Some(Err(CairnError::source_read(self.path.clone(), source)))
            }
        }
    }
}

/// Split `data` into content-defined chunks using FastCDC.
///
/// Returns a list of chunks. For empty data, returns an empty list.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes, hasher: Hasher) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![];
    }

    let chunker =
        fastcdc::v2020::FastCDC::new(data, sizes.min_size, sizes.avg_size, sizes.max_size);

    chunker
        .map(|c| {
            let chunk_data = &data[c.offset..c.offset + c.length];
            Chunk {
                offset: c.offset as u64,
                length: c.length,
                hash: hasher.digest(chunk_data),
                data: chunk_data.to_vec(),
            }
        })
        .collect()
}
