//! Per-chunk index writer
//!
//! One indexing task owns one of these. Entries land in
//! `<importRoot>/<partitionKey>/<chunkIndex>` in insertion order, which is
//! non-decreasing by source offset since rows are scanned sequentially.
//! Distinct chunks write distinct file names, so indexing tasks never
//! contend for an output path.

use crate::Result;
use ahash::AHashMap;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub struct IndexChunkWriter {
    import_root: PathBuf,
    chunk_index: usize,
    files: AHashMap<String, BufWriter<File>>,
}

impl IndexChunkWriter {
    pub fn new(import_root: &Path, chunk_index: usize) -> Self {
        Self {
            import_root: import_root.to_path_buf(),
            chunk_index,
            files: AHashMap::new(),
        }
    }

    /// Append one entry to the partition's chunk file, creating the
    /// partition directory and file on first touch.
    pub fn append(&mut self, partition_key: &str, timestamp: i64, offset: i64) -> Result<()> {
        if !self.files.contains_key(partition_key) {
            let dir = self.import_root.join(partition_key);
            fs::create_dir_all(&dir)?;
            let file = File::create(dir.join(self.chunk_index.to_string()))?;
            self.files
                .insert(partition_key.to_string(), BufWriter::new(file));
        }
        let w = self
            .files
            .get_mut(partition_key)
            .expect("file registered above");
        w.write_i64::<LittleEndian>(timestamp)?;
        w.write_i64::<LittleEndian>(offset)?;
        Ok(())
    }

    /// Flush and close all chunk files; returns the partition keys touched.
    pub fn finish(mut self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.files.keys().cloned().collect();
        keys.sort();
        for (_, w) in self.files.drain() {
            let file = w.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(keys)
    }
}
