//! Timestamp index files
//!
//! Phase two of the import writes, for every (chunk, partition) pair, an
//! append-only file of fixed 16-byte entries; phase three merges the chunk
//! files of one partition into a single timestamp-ordered index.
//!
//! Entry layout (little-endian):
//! ```text
//! +-------------------+-------------------+
//! | timestamp: i64    | file offset: i64  |
//! +-------------------+-------------------+
//! ```

mod chunk_writer;
mod merge;

pub use chunk_writer::IndexChunkWriter;
pub use merge::{merge_partition_index, MergedIndex};

/// Size of one on-disk index entry
pub const INDEX_ENTRY_SIZE: usize = 16;
/// Name of the merged per-partition index file
pub const MERGED_INDEX_FILE_NAME: &str = "INDEX.m";

/// A `(timestamp, source offset)` pair locating one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub offset: i64,
}
