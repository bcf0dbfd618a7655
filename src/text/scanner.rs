//! Quote-parity chunk scanner
//!
//! Phase one of the import pipeline: each worker scans its byte chunk and
//! counts `"` bytes, recording for either parity of the running quote count
//! the number of `\n` bytes seen and the file offset just past the first
//! one. Two adjacent chunks plus the global parity at the chunk's left edge
//! are enough for the coordinator to pick the true first safe line break.

use crate::{Result, StrataError};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Per-chunk output of the boundary check.
///
/// `first_newline` holds the file offset of the byte *after* the first
/// newline of each parity, -1 when no such newline was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteCensus {
    pub quote_count: u64,
    pub newline_count: [u64; 2],
    pub first_newline: [i64; 2],
}

impl QuoteCensus {
    pub fn empty() -> Self {
        Self {
            quote_count: 0,
            newline_count: [0, 0],
            first_newline: [-1, -1],
        }
    }
}

/// Sequential positioned reader over a byte range of a file.
///
/// Owns its buffer; the file descriptor is private to the reader and all
/// reads are positioned, so concurrent readers never share seek state.
pub struct ChunkReader {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    offset: u64,
    end: u64,
}

impl ChunkReader {
    pub fn open(path: &Path, lo: u64, hi: u64, buffer_len: usize) -> Result<Self> {
        debug_assert!(hi >= lo);
        debug_assert!(buffer_len > 0);
        let file = File::open(path).map_err(|e| StrataError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: vec![0u8; buffer_len],
            offset: lo,
            end: hi,
        })
    }

    /// Absolute file offset of the next byte this reader will return.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next buffer-full of the range. Returns an empty slice at
    /// the end of the range; a short read before the end is an error.
    pub fn fill(&mut self) -> Result<&[u8]> {
        if self.offset >= self.end {
            return Ok(&[]);
        }
        let want = ((self.end - self.offset) as usize).min(self.buf.len());
        let n = self
            .file
            .read_at(&mut self.buf[..want], self.offset)
            .map_err(|e| StrataError::ReadFailed {
                path: self.path.clone(),
                offset: self.offset,
                source: e,
            })?;
        if n == 0 {
            return Err(StrataError::ReadFailed {
                path: self.path.clone(),
                offset: self.offset,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read before chunk end",
                ),
            });
        }
        self.offset += n as u64;
        Ok(&self.buf[..n])
    }

    /// Positioned read of up to `buf.len()` bytes at an arbitrary offset.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file
            .read_at(buf, offset)
            .map_err(|e| StrataError::ReadFailed {
                path: self.path.clone(),
                offset,
                source: e,
            })
    }
}

/// Scan `[lo, hi)` of the source file and produce its quote census.
pub fn scan_chunk(path: &Path, lo: u64, hi: u64, buffer_len: usize) -> Result<QuoteCensus> {
    let mut reader = ChunkReader::open(path, lo, hi, buffer_len)?;
    let mut quotes: u64 = 0;
    let mut nl_count = [0u64; 2];
    let mut nl_first = [-1i64; 2];

    loop {
        let base = reader.offset();
        let chunk = reader.fill()?;
        if chunk.is_empty() {
            break;
        }
        for (i, &c) in chunk.iter().enumerate() {
            if c == b'"' {
                quotes += 1;
            } else if c == b'\n' {
                let parity = (quotes & 1) as usize;
                nl_count[parity] += 1;
                if nl_first[parity] == -1 {
                    nl_first[parity] = (base + i as u64 + 1) as i64;
                }
            }
        }
    }

    Ok(QuoteCensus {
        quote_count: quotes,
        newline_count: nl_count,
        first_newline: nl_first,
    })
}
