//! Engine surface for the importer
//!
//! A small table registry: create tables, hand out versioned readers and
//! attach imported partitions. Every attach (or drop, or forced reader
//! release) bumps the table version; a reader that outlives a bump fails
//! its next `check_current` with `ReaderOutOfDate` and the caller re-opens
//! it, bounded by `MAX_READER_RETRIES`.

use crate::config::PartitionBy;
use crate::schema::TableSchema;
use crate::table::{PartitionMeta, TableHandle, TableMeta, TableWriter};
use crate::{Result, StrataError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Bounded retry attempts for readers invalidated mid-use
pub const MAX_READER_RETRIES: u32 = 10;

struct TableEntry {
    id: u32,
    version: u64,
    dir: PathBuf,
}

struct Registry {
    tables: HashMap<String, TableEntry>,
    next_id: u32,
}

/// Storage engine: owns the database root and the table registry.
pub struct Engine {
    db_root: PathBuf,
    registry: RwLock<Registry>,
}

impl Engine {
    pub fn new(db_root: impl Into<PathBuf>) -> Result<Self> {
        let db_root = db_root.into();
        fs::create_dir_all(&db_root)?;
        Ok(Self {
            db_root,
            registry: RwLock::new(Registry {
                tables: HashMap::new(),
                next_id: 1,
            }),
        })
    }

    pub fn db_root(&self) -> &Path {
        &self.db_root
    }

    /// Create and register an empty table.
    pub fn create_table(&self, schema: TableSchema, partition_by: PartitionBy) -> Result<()> {
        let name = schema.table_name.clone();
        {
            let registry = self.registry.read();
            if registry.tables.contains_key(&name) {
                return Err(StrataError::TableExists(name));
            }
        }
        let writer = TableWriter::create(&self.db_root, schema, partition_by)?;
        let dir = writer.table_dir().to_path_buf();
        let mut registry = self.registry.write();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.tables.insert(
            name,
            TableEntry {
                id,
                version: 0,
                dir,
            },
        );
        Ok(())
    }

    /// Drop a table and remove its directory.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .write()
            .tables
            .remove(name)
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))?;
        if entry.dir.exists() {
            fs::remove_dir_all(&entry.dir)?;
        }
        Ok(())
    }

    pub fn table_dir(&self, name: &str) -> Result<PathBuf> {
        let registry = self.registry.read();
        registry
            .tables
            .get(name)
            .map(|e| e.dir.clone())
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))
    }

    /// Open a reader pinned to the table's current version.
    pub fn reader(&self, name: &str) -> Result<TableReader> {
        let (id, version, dir) = {
            let registry = self.registry.read();
            let entry = registry
                .tables
                .get(name)
                .ok_or_else(|| StrataError::TableNotFound(name.to_string()))?;
            (entry.id, entry.version, entry.dir.clone())
        };
        Ok(TableReader {
            table_name: name.to_string(),
            table_id: id,
            version,
            handle: TableHandle::open(dir)?,
        })
    }

    /// Invalidate every outstanding reader by bumping all table versions.
    /// The importer calls this before attaching partitions so no reader
    /// holds column or index files across the cutover.
    pub fn release_all_readers(&self) {
        let mut registry = self.registry.write();
        for entry in registry.tables.values_mut() {
            entry.version += 1;
        }
    }

    fn bump_version(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write();
        let entry = registry
            .tables
            .get_mut(name)
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))?;
        entry.version += 1;
        Ok(())
    }

    /// Validate a reader against the registry.
    pub fn check_reader(&self, reader: &TableReader) -> Result<()> {
        let registry = self.registry.read();
        let entry = registry
            .tables
            .get(&reader.table_name)
            .ok_or_else(|| StrataError::TableNotFound(reader.table_name.clone()))?;
        if entry.id != reader.table_id || entry.version != reader.version {
            return Err(StrataError::ReaderOutOfDate {
                table_name: reader.table_name.clone(),
                expected_id: reader.table_id,
                actual_id: entry.id,
                expected_version: reader.version,
                actual_version: entry.version,
            });
        }
        Ok(())
    }

    /// Run `f` with a fresh reader, re-opening it when the table changes
    /// underneath, up to `MAX_READER_RETRIES` times.
    pub fn read_with_retry<T, F>(&self, name: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&TableReader) -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let reader = self.reader(name)?;
            match f(&reader) {
                Err(StrataError::ReaderOutOfDate { .. }) if attempt < MAX_READER_RETRIES => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Move the partitions of a committed shadow table into the final
    /// table and fold their row counts and index flags into its metadata.
    /// Partitions imported by distinct workers are disjoint.
    pub fn attach_partitions(&self, final_table: &str, shadow_dir: &Path) -> Result<()> {
        let final_dir = self.table_dir(final_table)?;
        let shadow_meta = TableMeta::load(shadow_dir)?;
        let mut final_meta = TableMeta::load(&final_dir)?;

        for partition in &shadow_meta.partitions {
            let src = shadow_dir.join(&partition.name);
            let dst = final_dir.join(&partition.name);
            if dst.exists() {
                return Err(StrataError::Corrupt(format!(
                    "partition '{}' attached twice to '{final_table}'",
                    partition.name
                )));
            }
            fs::rename(&src, &dst)?;
            final_meta.partitions.push(PartitionMeta {
                name: partition.name.clone(),
                row_count: partition.row_count,
            });
        }
        for (i, col) in shadow_meta.schema.columns.iter().enumerate() {
            if col.indexed {
                final_meta.add_index(i, col.index_value_block_capacity);
            }
        }
        final_meta.partitions.sort_by(|a, b| a.name.cmp(&b.name));
        final_meta.save(&final_dir)?;
        self.bump_version(final_table)?;
        Ok(())
    }

    /// Refresh the final table's dictionary entry counts after a merge.
    pub fn update_symbol_counts(&self, table: &str, counts: &[(usize, u64)]) -> Result<()> {
        let dir = self.table_dir(table)?;
        let mut meta = TableMeta::load(&dir)?;
        for &(column_index, count) in counts {
            meta.symbol_counts[column_index] = count;
        }
        meta.save(&dir)?;
        self.bump_version(table)
    }
}

/// A reader snapshot pinned to one table version.
pub struct TableReader {
    table_name: String,
    table_id: u32,
    version: u64,
    handle: TableHandle,
}

impl TableReader {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn handle(&self) -> &TableHandle {
        &self.handle
    }

    pub fn meta(&self) -> &TableMeta {
        self.handle.meta()
    }

    /// Fail with `ReaderOutOfDate` if the table changed since this reader
    /// was opened.
    pub fn check_current(&self, engine: &Engine) -> Result<()> {
        engine.check_reader(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use tempfile::tempdir;

    fn schema(name: &str) -> TableSchema {
        TableSchema::new(
            name,
            vec![
                ColumnDef::new("v", ColumnType::Long),
                ColumnDef::new("ts", ColumnType::Timestamp),
            ],
            1,
        )
    }

    #[test]
    fn test_create_and_reader() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db")).unwrap();
        engine.create_table(schema("t"), PartitionBy::Day).unwrap();
        assert!(matches!(
            engine.create_table(schema("t"), PartitionBy::Day),
            Err(StrataError::TableExists(_))
        ));

        let reader = engine.reader("t").unwrap();
        assert!(reader.check_current(&engine).is_ok());
        assert!(reader.meta().partitions.is_empty());
    }

    #[test]
    fn test_release_invalidates_readers() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db")).unwrap();
        engine.create_table(schema("t"), PartitionBy::Day).unwrap();

        let reader = engine.reader("t").unwrap();
        engine.release_all_readers();
        match reader.check_current(&engine) {
            Err(StrataError::ReaderOutOfDate {
                expected_version,
                actual_version,
                ..
            }) => {
                assert_eq!(expected_version, 0);
                assert_eq!(actual_version, 1);
            }
            other => panic!("expected ReaderOutOfDate, got {other:?}"),
        }
    }

    #[test]
    fn test_read_with_retry_reopens() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db")).unwrap();
        engine.create_table(schema("t"), PartitionBy::Day).unwrap();

        let mut failures = 2;
        let out = engine
            .read_with_retry("t", |reader| {
                if failures > 0 {
                    failures -= 1;
                    engine.release_all_readers();
                    reader.check_current(&engine)?;
                }
                Ok(reader.meta().schema.table_name.clone())
            })
            .unwrap();
        assert_eq!(out, "t");
    }

    #[test]
    fn test_drop_table() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db")).unwrap();
        engine.create_table(schema("t"), PartitionBy::Day).unwrap();
        let table_dir = engine.table_dir("t").unwrap();
        assert!(table_dir.exists());
        engine.drop_table("t").unwrap();
        assert!(!table_dir.exists());
        assert!(matches!(
            engine.reader("t"),
            Err(StrataError::TableNotFound(_))
        ));
    }
}
