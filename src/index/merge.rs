//! Per-partition index merge
//!
//! Memory-maps every chunk file of a partition and k-way merges the
//! entries into `INDEX.m`, ascending by timestamp. Timestamp ties break by
//! source chunk index, then by source byte offset, so rows with equal
//! timestamps keep source order. Source maps are unmapped on every exit
//! path when the merge scope ends.

use crate::index::{IndexEntry, INDEX_ENTRY_SIZE, MERGED_INDEX_FILE_NAME};
use crate::{Result, StrataError};
use memmap2::{Mmap, MmapMut};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// The merged, timestamp-ordered index of one partition.
pub struct MergedIndex {
    mmap: Option<Mmap>,
    count: usize,
}

impl MergedIndex {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entry(&self, i: usize) -> IndexEntry {
        debug_assert!(i < self.count);
        let data = self.mmap.as_ref().expect("non-empty index is mapped");
        let base = i * INDEX_ENTRY_SIZE;
        let timestamp = i64::from_le_bytes(data[base..base + 8].try_into().expect("8 bytes"));
        let offset = i64::from_le_bytes(data[base + 8..base + 16].try_into().expect("8 bytes"));
        IndexEntry { timestamp, offset }
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.count).map(move |i| self.entry(i))
    }
}

fn read_entry(data: &[u8], i: usize) -> IndexEntry {
    let base = i * INDEX_ENTRY_SIZE;
    IndexEntry {
        timestamp: i64::from_le_bytes(data[base..base + 8].try_into().expect("8 bytes")),
        offset: i64::from_le_bytes(data[base + 8..base + 16].try_into().expect("8 bytes")),
    }
}

/// Merge all chunk index files under `partition_dir` into `INDEX.m` and
/// return the mapped result.
pub fn merge_partition_index(partition_dir: &Path) -> Result<MergedIndex> {
    // chunk files are named by their chunk index
    let mut chunk_files: Vec<(usize, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(partition_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == MERGED_INDEX_FILE_NAME {
            continue;
        }
        let chunk_index: usize = name.parse().map_err(|_| {
            StrataError::Corrupt(format!(
                "unexpected file in partition index directory: {}",
                entry.path().display()
            ))
        })?;
        chunk_files.push((chunk_index, entry.path()));
    }
    chunk_files.sort_by_key(|(i, _)| *i);

    let mut sources: Vec<Mmap> = Vec::with_capacity(chunk_files.len());
    let mut total: usize = 0;
    for (_, path) in &chunk_files {
        let file = File::open(path).map_err(|e| StrataError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            continue;
        }
        if len % INDEX_ENTRY_SIZE != 0 {
            return Err(StrataError::Corrupt(format!(
                "index chunk {} has truncated entry (len={})",
                path.display(),
                len
            )));
        }
        total += len;
        sources.push(unsafe { Mmap::map(&file)? });
    }

    let out_path = partition_dir.join(MERGED_INDEX_FILE_NAME);
    let out_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&out_path)?;
    out_file.set_len(total as u64)?;
    if total == 0 {
        return Ok(MergedIndex {
            mmap: None,
            count: 0,
        });
    }
    let mut out = unsafe { MmapMut::map_mut(&out_file)? };

    // heap keyed by (timestamp, source chunk order, source offset)
    let mut heap: BinaryHeap<Reverse<(i64, usize, i64, usize)>> = BinaryHeap::new();
    for (s, src) in sources.iter().enumerate() {
        let e = read_entry(src, 0);
        heap.push(Reverse((e.timestamp, s, e.offset, 0)));
    }

    let mut written = 0usize;
    while let Some(Reverse((timestamp, s, offset, pos))) = heap.pop() {
        let base = written * INDEX_ENTRY_SIZE;
        out[base..base + 8].copy_from_slice(&timestamp.to_le_bytes());
        out[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
        written += 1;

        let next = pos + 1;
        if (next + 1) * INDEX_ENTRY_SIZE <= sources[s].len() {
            let e = read_entry(&sources[s], next);
            heap.push(Reverse((e.timestamp, s, e.offset, next)));
        }
    }
    debug_assert_eq!(written * INDEX_ENTRY_SIZE, total);

    out.flush()?;
    let mmap = out.make_read_only()?;
    Ok(MergedIndex {
        mmap: Some(mmap),
        count: total / INDEX_ENTRY_SIZE,
    })
}
