//! Table metadata persistence
//!
//! `_meta` file format:
//! ```text
//! +----------------+--------------+--------------+------------------+
//! | magic "SMET"   | crc32: u32   | len: u32     | bincode payload  |
//! +----------------+--------------+--------------+------------------+
//! ```
//! The checksum covers the payload only.

use crate::config::PartitionBy;
use crate::schema::TableSchema;
use crate::{Result, StrataError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub const META_FILE_NAME: &str = "_meta";

const META_MAGIC: &[u8; 4] = b"SMET";

/// One partition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub name: String,
    pub row_count: u64,
}

/// Persistent table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: TableSchema,
    pub partition_by: PartitionBy,
    pub partitions: Vec<PartitionMeta>,
    /// Dictionary entry count per column (0 for non-symbol columns)
    pub symbol_counts: Vec<u64>,
}

impl TableMeta {
    pub fn new(schema: TableSchema, partition_by: PartitionBy) -> Self {
        let columns = schema.column_count();
        Self {
            schema,
            partition_by,
            partitions: Vec::new(),
            symbol_counts: vec![0; columns],
        }
    }

    pub fn is_column_indexed(&self, column_index: usize) -> bool {
        self.schema.columns[column_index].indexed
    }

    pub fn index_value_block_capacity(&self, column_index: usize) -> usize {
        self.schema.columns[column_index].index_value_block_capacity
    }

    pub fn partition_row_count(&self, name: &str) -> Option<u64> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.row_count)
    }

    /// Record a value-list index on a column.
    pub fn add_index(&mut self, column_index: usize, capacity: usize) {
        self.schema.columns[column_index].indexed = true;
        self.schema.columns[column_index].index_value_block_capacity = capacity;
    }

    pub fn save(&self, table_dir: &Path) -> Result<()> {
        let payload = bincode::serialize(self)
            .map_err(|e| StrataError::Corrupt(format!("cannot serialize table meta: {e}")))?;
        let crc = crc32fast::hash(&payload);
        let mut file = File::create(table_dir.join(META_FILE_NAME))?;
        file.write_all(META_MAGIC)?;
        file.write_u32::<LittleEndian>(crc)?;
        file.write_u32::<LittleEndian>(payload.len() as u32)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(table_dir: &Path) -> Result<Self> {
        let path = table_dir.join(META_FILE_NAME);
        let mut file = File::open(&path).map_err(|e| StrataError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != META_MAGIC {
            return Err(StrataError::Corrupt(format!(
                "bad meta magic in {}",
                path.display()
            )));
        }
        let crc = file.read_u32::<LittleEndian>()?;
        let len = file.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(StrataError::Corrupt(format!(
                "meta checksum mismatch in {}",
                path.display()
            )));
        }
        bincode::deserialize(&payload)
            .map_err(|e| StrataError::Corrupt(format!("cannot deserialize table meta: {e}")))
    }
}
