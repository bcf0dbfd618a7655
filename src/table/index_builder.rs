//! Value-list index builder
//!
//! Builds, for one symbol column of one table, a posting-list index per
//! partition after keys have been remapped to the final dictionary:
//!
//! ```text
//! <col>.k   per key: [first block offset: u64][row count: u64]
//! <col>.v   fixed-size value blocks of `capacity` row-id slots (u64)
//! ```
//!
//! Each key's posting list occupies a contiguous run of blocks starting
//! at its `.k` offset; the trailing slots of the run's last block are
//! zero-padded, so row id `j` of a key lives at `first + j * 8` and the
//! block capacity is the index's append granularity.

use crate::schema::ColumnType;
use crate::table::{
    TableMeta, COLUMN_FILE_SUFFIX, INDEX_KEY_FILE_SUFFIX, INDEX_VALUE_FILE_SUFFIX,
};
use crate::{Result, StrataError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Build the value-list index of one column across every partition of the
/// table. Metadata is not touched; the caller records the index there.
pub fn build_value_index(
    table_dir: &Path,
    meta: &TableMeta,
    column_index: usize,
    capacity: usize,
) -> Result<()> {
    let col = &meta.schema.columns[column_index];
    if col.column_type != ColumnType::Symbol {
        return Err(StrataError::InvalidConfig(format!(
            "cannot index non-symbol column '{}'",
            col.name
        )));
    }

    for partition in &meta.partitions {
        let dir = table_dir.join(&partition.name);
        let col_path = dir.join(format!("{}{COLUMN_FILE_SUFFIX}", col.name));
        let mut reader = BufReader::new(File::open(&col_path).map_err(|e| {
            StrataError::OpenFailed {
                path: col_path.clone(),
                source: e,
            }
        })?);

        // posting lists keyed by final dictionary key
        let mut postings: Vec<Vec<u64>> = Vec::new();
        for row in 0..partition.row_count {
            let key = reader.read_i32::<LittleEndian>()?;
            if key < 0 {
                continue;
            }
            let key = key as usize;
            if key >= postings.len() {
                postings.resize_with(key + 1, Vec::new);
            }
            postings[key].push(row);
        }

        let mut keys = BufWriter::new(File::create(
            dir.join(format!("{}{INDEX_KEY_FILE_SUFFIX}", col.name)),
        )?);
        let mut values = BufWriter::new(File::create(
            dir.join(format!("{}{INDEX_VALUE_FILE_SUFFIX}", col.name)),
        )?);

        let mut value_offset: u64 = 0;
        for list in &postings {
            keys.write_u64::<LittleEndian>(value_offset)?;
            keys.write_u64::<LittleEndian>(list.len() as u64)?;
            for block in list.chunks(capacity) {
                for &row_id in block {
                    values.write_u64::<LittleEndian>(row_id)?;
                }
                for _ in block.len()..capacity {
                    values.write_u64::<LittleEndian>(0)?;
                }
            }
            // a key with no rows owns no blocks; its count of 0 tells the
            // reader never to dereference the offset
            let blocks = list.len().div_ceil(capacity);
            value_offset += (blocks * capacity) as u64 * 8;
        }
        keys.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        values.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }
    Ok(())
}
