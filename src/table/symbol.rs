//! Symbol dictionaries, dictionary merge and key remapping
//!
//! Every symbol column of a table has an append-only dictionary mapping
//! strings to contiguous `u32` keys, persisted as `<col>.sym`:
//! `[u32 len][utf8 bytes]` per entry, in key order, so a sequential read
//! yields entries in local-key order.
//!
//! After import, per-worker dictionaries are unioned into the final
//! table's dictionary and each worker gets a `<col>.r` remap file: an
//! `i32` array indexed by local key yielding the final key. Shadow column
//! files are then rewritten in place through the remap.

use crate::{Result, StrataError};
use ahash::AHashMap;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Suffix of on-disk symbol dictionaries
pub const SYMBOL_FILE_SUFFIX: &str = ".sym";
/// Suffix of symbol key remap files
pub const KEY_REMAP_FILE_SUFFIX: &str = ".r";

/// In-memory append-only `string -> key` mapping with contiguous keys.
pub struct SymbolDictionary {
    map: AHashMap<String, u32>,
    names: Vec<String>,
}

impl SymbolDictionary {
    pub fn new() -> Self {
        Self {
            map: AHashMap::new(),
            names: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<u32> {
        self.map.get(symbol).copied()
    }

    pub fn name(&self, key: u32) -> Option<&str> {
        self.names.get(key as usize).map(|s| s.as_str())
    }

    /// Idempotent insert: returns the existing key when the symbol is
    /// already present.
    pub fn put(&mut self, symbol: &str, column: &str) -> Result<u32> {
        if let Some(&key) = self.map.get(symbol) {
            return Ok(key);
        }
        if self.names.len() > i32::MAX as usize {
            return Err(StrataError::SymbolOverflow {
                column: column.to_string(),
            });
        }
        let key = self.names.len() as u32;
        self.names.push(symbol.to_string());
        self.map.insert(symbol.to_string(), key);
        Ok(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }
}

impl Default for SymbolDictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer over one column's dictionary file.
pub struct SymbolMapWriter {
    dict: SymbolDictionary,
    path: PathBuf,
    column: String,
}

impl SymbolMapWriter {
    /// Open the dictionary of `column` under `table_dir`, loading any
    /// existing entries.
    pub fn open(table_dir: &Path, column: &str) -> Result<Self> {
        let path = table_dir.join(format!("{column}{SYMBOL_FILE_SUFFIX}"));
        let mut dict = SymbolDictionary::new();
        if path.exists() {
            let mut reader = SymbolMapReader::open(table_dir, column)?;
            while let Some(name) = reader.next_symbol()? {
                dict.put(&name, column)?;
            }
        }
        Ok(Self {
            dict,
            path,
            column: column.to_string(),
        })
    }

    /// Idempotent insert, like the underlying dictionary.
    pub fn put_symbol(&mut self, symbol: &str) -> Result<u32> {
        self.dict.put(symbol, &self.column)
    }

    pub fn symbol_count(&self) -> usize {
        self.dict.len()
    }

    pub fn dictionary(&self) -> &SymbolDictionary {
        &self.dict
    }

    /// Persist the dictionary in key order.
    pub fn save(&self) -> Result<()> {
        let mut w = BufWriter::new(File::create(&self.path)?);
        for name in self.dict.iter() {
            w.write_u32::<LittleEndian>(name.len() as u32)?;
            w.write_all(name.as_bytes())?;
        }
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over a dictionary file; yields entries in local-key
/// order.
pub struct SymbolMapReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl SymbolMapReader {
    pub fn open(table_dir: &Path, column: &str) -> Result<Self> {
        let path = table_dir.join(format!("{column}{SYMBOL_FILE_SUFFIX}"));
        let file = File::open(&path).map_err(|e| StrataError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            remaining,
        })
    }

    pub fn next_symbol(&mut self) -> Result<Option<String>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let len = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        self.remaining = self
            .remaining
            .checked_sub(4 + len as u64)
            .ok_or_else(|| StrataError::Corrupt("truncated symbol dictionary".to_string()))?;
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| StrataError::Corrupt("invalid UTF-8 in symbol dictionary".to_string()))
    }
}

/// Union one worker's dictionary for `column` into the final dictionary
/// and write the worker's remap file. Returns the number of local keys
/// remapped.
pub fn merge_symbols(
    final_writer: &mut SymbolMapWriter,
    shadow_table_dir: &Path,
    column: &str,
) -> Result<usize> {
    let mut reader = SymbolMapReader::open(shadow_table_dir, column)?;
    let remap_path = shadow_table_dir.join(format!("{column}{KEY_REMAP_FILE_SUFFIX}"));
    let mut remap = BufWriter::new(File::create(&remap_path)?);
    let mut count = 0usize;
    while let Some(symbol) = reader.next_symbol()? {
        let final_key = final_writer.put_symbol(&symbol)?;
        remap.write_i32::<LittleEndian>(final_key as i32)?;
        count += 1;
    }
    let file = remap.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(count)
}

/// Rewrite an on-disk symbol-key column through the worker's remap table.
///
/// `row_count` rows of `i32` keys are translated in place; NULL keys are
/// left alone. Either mapping smaller than one key is a no-op (empty
/// partition); a non-NULL key at or beyond `symbol_count` means the remap
/// is undersized and the table is corrupt.
pub fn update_symbol_keys(
    column_path: &Path,
    remap_path: &Path,
    row_count: u64,
    symbol_count: u64,
    column: &str,
) -> Result<()> {
    let column_file = open_rw(column_path)?;
    let column_size = column_file.metadata()?.len();
    let remap_file = open_rw(remap_path)?;
    let remap_size = remap_file.metadata()?.len();

    if column_size < 4 || remap_size < 4 {
        return Ok(());
    }
    if row_count * 4 > column_size {
        return Err(StrataError::Corrupt(format!(
            "symbol column {} shorter than partition ({} rows, {} bytes)",
            column_path.display(),
            row_count,
            column_size
        )));
    }
    if symbol_count * 4 > remap_size {
        return Err(StrataError::RemapUndersized {
            column: column.to_string(),
            symbols: symbol_count as usize,
            referenced: symbol_count as i32,
        });
    }

    let mut column_mem = unsafe { MmapMut::map_mut(&column_file)? };
    let remap_mem = unsafe { MmapMut::map_mut(&remap_file)? };

    for row in 0..row_count as usize {
        let base = row * 4;
        let key = i32::from_le_bytes(column_mem[base..base + 4].try_into().expect("4 bytes"));
        if key < 0 {
            continue;
        }
        if key as u64 >= symbol_count {
            return Err(StrataError::RemapUndersized {
                column: column.to_string(),
                symbols: symbol_count as usize,
                referenced: key,
            });
        }
        let rbase = key as usize * 4;
        let mapped = &remap_mem[rbase..rbase + 4];
        column_mem[base..base + 4].copy_from_slice(mapped);
    }
    column_mem.flush()?;
    Ok(())
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StrataError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dictionary_contiguous_keys() {
        let mut dict = SymbolDictionary::new();
        assert_eq!(dict.put("ALPHA", "s").unwrap(), 0);
        assert_eq!(dict.put("OMEGA", "s").unwrap(), 1);
        assert_eq!(dict.put("ALPHA", "s").unwrap(), 0);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.name(1), Some("OMEGA"));
    }

    #[test]
    fn test_writer_save_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut w = SymbolMapWriter::open(dir.path(), "sensor").unwrap();
            w.put_symbol("A").unwrap();
            w.put_symbol("B").unwrap();
            w.save().unwrap();
        }
        let mut w = SymbolMapWriter::open(dir.path(), "sensor").unwrap();
        assert_eq!(w.symbol_count(), 2);
        // existing entries keep their keys
        assert_eq!(w.put_symbol("B").unwrap(), 1);
        assert_eq!(w.put_symbol("C").unwrap(), 2);
    }

    #[test]
    fn test_merge_symbols_remap() {
        let dir = tempdir().unwrap();
        let final_dir = dir.path().join("final");
        let w0 = dir.path().join("t_0");
        let w1 = dir.path().join("t_1");
        for d in [&final_dir, &w0, &w1] {
            std::fs::create_dir_all(d).unwrap();
        }
        // worker 0: {A:0, B:1}; worker 1: {B:0, C:1}
        let mut d0 = SymbolMapWriter::open(&w0, "s").unwrap();
        d0.put_symbol("A").unwrap();
        d0.put_symbol("B").unwrap();
        d0.save().unwrap();
        let mut d1 = SymbolMapWriter::open(&w1, "s").unwrap();
        d1.put_symbol("B").unwrap();
        d1.put_symbol("C").unwrap();
        d1.save().unwrap();

        let mut final_writer = SymbolMapWriter::open(&final_dir, "s").unwrap();
        assert_eq!(merge_symbols(&mut final_writer, &w0, "s").unwrap(), 2);
        assert_eq!(merge_symbols(&mut final_writer, &w1, "s").unwrap(), 2);
        final_writer.save().unwrap();

        // final dictionary is {A:0, B:1, C:2}
        assert_eq!(final_writer.symbol_count(), 3);
        assert_eq!(final_writer.dictionary().get("C"), Some(2));

        let r0 = std::fs::read(w0.join("s.r")).unwrap();
        assert_eq!(r0, [0i32.to_le_bytes(), 1i32.to_le_bytes()].concat());
        let r1 = std::fs::read(w1.join("s.r")).unwrap();
        assert_eq!(r1, [1i32.to_le_bytes(), 2i32.to_le_bytes()].concat());
    }

    #[test]
    fn test_update_symbol_keys() {
        let dir = tempdir().unwrap();
        let col = dir.path().join("s.d");
        let remap = dir.path().join("s.r");
        // local keys 0,1,-1,1 ; remap 0->5, 1->9
        let keys: Vec<u8> = [0i32, 1, -1, 1]
            .iter()
            .flat_map(|k| k.to_le_bytes())
            .collect();
        std::fs::write(&col, &keys).unwrap();
        let map: Vec<u8> = [5i32, 9].iter().flat_map(|k| k.to_le_bytes()).collect();
        std::fs::write(&remap, &map).unwrap();

        update_symbol_keys(&col, &remap, 4, 2, "s").unwrap();
        let out = std::fs::read(&col).unwrap();
        let got: Vec<i32> = out
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(got, vec![5, 9, -1, 9]);
    }

    #[test]
    fn test_update_symbol_keys_empty_is_noop() {
        let dir = tempdir().unwrap();
        let col = dir.path().join("s.d");
        let remap = dir.path().join("s.r");
        std::fs::write(&col, []).unwrap();
        std::fs::write(&remap, []).unwrap();
        update_symbol_keys(&col, &remap, 0, 0, "s").unwrap();
    }

    #[test]
    fn test_update_symbol_keys_undersized_remap() {
        let dir = tempdir().unwrap();
        let col = dir.path().join("s.d");
        let remap = dir.path().join("s.r");
        let keys: Vec<u8> = [0i32, 3].iter().flat_map(|k| k.to_le_bytes()).collect();
        std::fs::write(&col, &keys).unwrap();
        std::fs::write(&remap, 0i32.to_le_bytes()).unwrap();

        let err = update_symbol_keys(&col, &remap, 2, 1, "s").unwrap_err();
        match err {
            StrataError::RemapUndersized { referenced, .. } => assert_eq!(referenced, 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
