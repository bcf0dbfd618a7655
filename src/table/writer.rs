//! Columnar table writer
//!
//! Appends rows to a partitioned table in the native layout. Rows are
//! staged field by field and only hit the column files on `append`, so a
//! cancelled row leaves no partial data behind. Partition switching is
//! driven by the designated timestamp; closing a partition flushes and
//! fsyncs its column files.

use crate::config::PartitionBy;
use crate::schema::{ColumnType, TableSchema};
use crate::table::{
    SymbolMapWriter, TableMeta, PartitionMeta, COLUMN_FILE_SUFFIX, NULL_INT, NULL_LONG,
    NULL_STR_LEN, NULL_SYMBOL_KEY,
};
use crate::{Result, StrataError};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A value staged on the in-flight row.
#[derive(Debug, Clone, PartialEq)]
enum Staged {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Date(i64),
    Timestamp(i64),
    Str(String),
    Symbol(String),
}

struct OpenPartition {
    name: String,
    row_count: u64,
    files: Vec<BufWriter<File>>,
}

pub struct TableWriter {
    table_dir: PathBuf,
    meta: TableMeta,
    symbol_writers: Vec<Option<SymbolMapWriter>>,
    current: Option<OpenPartition>,
    staged: Vec<Staged>,
}

impl TableWriter {
    /// Create a fresh table directory under `parent_dir` and open a writer
    /// on it. Fails if the table already exists.
    pub fn create(parent_dir: &Path, schema: TableSchema, partition_by: PartitionBy) -> Result<Self> {
        let table_dir = parent_dir.join(&schema.table_name);
        if table_dir.exists() {
            return Err(StrataError::TableExists(schema.table_name.clone()));
        }
        fs::create_dir_all(&table_dir)?;
        let meta = TableMeta::new(schema, partition_by);
        meta.save(&table_dir)?;
        Self::open(table_dir, meta)
    }

    fn open(table_dir: PathBuf, meta: TableMeta) -> Result<Self> {
        let mut symbol_writers = Vec::with_capacity(meta.schema.column_count());
        for col in &meta.schema.columns {
            if col.column_type == ColumnType::Symbol {
                symbol_writers.push(Some(SymbolMapWriter::open(&table_dir, &col.name)?));
            } else {
                symbol_writers.push(None);
            }
        }
        let staged = vec![Staged::Null; meta.schema.column_count()];
        Ok(Self {
            table_dir,
            meta,
            symbol_writers,
            current: None,
            staged,
        })
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Start a row at the given designated timestamp. Switches partitions
    /// when the timestamp falls into a different bucket.
    pub fn new_row(&mut self, timestamp: i64) -> Result<Row<'_>> {
        let name = self.meta.partition_by.dir_name(timestamp);
        let switch = match &self.current {
            Some(p) => p.name != name,
            None => true,
        };
        if switch {
            self.close_current_partition()?;
            self.open_partition(&name)?;
        }
        for v in self.staged.iter_mut() {
            *v = Staged::Null;
        }
        self.staged[self.meta.schema.timestamp_index] = Staged::Timestamp(timestamp);
        Ok(Row { writer: self })
    }

    fn open_partition(&mut self, name: &str) -> Result<()> {
        let dir = self.table_dir.join(name);
        fs::create_dir_all(&dir)?;
        let mut files = Vec::with_capacity(self.meta.schema.column_count());
        for col in &self.meta.schema.columns {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(dir.join(format!("{}{COLUMN_FILE_SUFFIX}", col.name)))?;
            files.push(BufWriter::new(file));
        }
        let row_count = self.meta.partition_row_count(name).unwrap_or(0);
        self.current = Some(OpenPartition {
            name: name.to_string(),
            row_count,
            files,
        });
        Ok(())
    }

    fn close_current_partition(&mut self) -> Result<()> {
        let Some(mut partition) = self.current.take() else {
            return Ok(());
        };
        for w in partition.files.drain(..) {
            let file = w.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        match self
            .meta
            .partitions
            .iter_mut()
            .find(|p| p.name == partition.name)
        {
            Some(p) => p.row_count = partition.row_count,
            None => self.meta.partitions.push(PartitionMeta {
                name: partition.name,
                row_count: partition.row_count,
            }),
        }
        Ok(())
    }

    fn append_staged(&mut self) -> Result<()> {
        let partition = self
            .current
            .as_mut()
            .expect("new_row opened a partition");
        for (i, col) in self.meta.schema.columns.iter().enumerate() {
            let w = &mut partition.files[i];
            let staged = std::mem::replace(&mut self.staged[i], Staged::Null);
            match (col.column_type, staged) {
                (ColumnType::Boolean, Staged::Bool(v)) => w.write_u8(v as u8)?,
                (ColumnType::Boolean, _) => w.write_u8(0)?,
                (ColumnType::Int, Staged::Int(v)) => w.write_i32::<LittleEndian>(v)?,
                (ColumnType::Int, _) => w.write_i32::<LittleEndian>(NULL_INT)?,
                (ColumnType::Long, Staged::Long(v)) => w.write_i64::<LittleEndian>(v)?,
                (ColumnType::Long, _) => w.write_i64::<LittleEndian>(NULL_LONG)?,
                (ColumnType::Double, Staged::Double(v)) => w.write_f64::<LittleEndian>(v)?,
                (ColumnType::Double, _) => w.write_f64::<LittleEndian>(f64::NAN)?,
                (ColumnType::Date, Staged::Date(v)) => w.write_i64::<LittleEndian>(v)?,
                (ColumnType::Date, _) => w.write_i64::<LittleEndian>(NULL_LONG)?,
                (ColumnType::Timestamp, Staged::Timestamp(v)) => {
                    w.write_i64::<LittleEndian>(v)?
                }
                (ColumnType::Timestamp, _) => w.write_i64::<LittleEndian>(NULL_LONG)?,
                (ColumnType::Str, Staged::Str(s)) => {
                    w.write_u32::<LittleEndian>(s.len() as u32)?;
                    w.write_all(s.as_bytes())?;
                }
                (ColumnType::Str, _) => w.write_u32::<LittleEndian>(NULL_STR_LEN)?,
                (ColumnType::Symbol, Staged::Symbol(s)) => {
                    let key = self.symbol_writers[i]
                        .as_mut()
                        .expect("symbol column has a dictionary")
                        .put_symbol(&s)?;
                    w.write_i32::<LittleEndian>(key as i32)?;
                }
                (ColumnType::Symbol, _) => w.write_i32::<LittleEndian>(NULL_SYMBOL_KEY)?,
            }
        }
        partition.row_count += 1;
        Ok(())
    }

    fn cancel_staged(&mut self) {
        for v in self.staged.iter_mut() {
            *v = Staged::Null;
        }
    }

    /// Flush and fsync all column files, persist dictionaries and
    /// metadata.
    pub fn commit_sync(&mut self) -> Result<()> {
        self.close_current_partition()?;
        for (i, sw) in self.symbol_writers.iter().enumerate() {
            if let Some(sw) = sw {
                sw.save()?;
                self.meta.symbol_counts[i] = sw.symbol_count() as u64;
            }
        }
        self.meta.partitions.sort_by(|a, b| a.name.cmp(&b.name));
        self.meta.save(&self.table_dir)?;
        Ok(())
    }

    /// Discard everything written through this writer: partition data is
    /// removed and the metadata reset to empty.
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(mut partition) = self.current.take() {
            partition.files.clear();
            self.meta.partitions.push(PartitionMeta {
                name: partition.name,
                row_count: 0,
            });
        }
        for p in self.meta.partitions.drain(..).collect::<Vec<_>>() {
            let dir = self.table_dir.join(&p.name);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        for (i, sw) in self.symbol_writers.iter_mut().enumerate() {
            if sw.is_some() {
                let name = self.meta.schema.columns[i].name.clone();
                let sym_path = self
                    .table_dir
                    .join(format!("{name}{}", crate::table::SYMBOL_FILE_SUFFIX));
                if sym_path.exists() {
                    fs::remove_file(&sym_path)?;
                }
                *sw = Some(SymbolMapWriter::open(&self.table_dir, &name)?);
                self.meta.symbol_counts[i] = 0;
            }
        }
        self.meta.save(&self.table_dir)?;
        Ok(())
    }
}

/// One in-flight row. Values are staged until `append`; `cancel` (or drop)
/// discards them.
pub struct Row<'a> {
    writer: &'a mut TableWriter,
}

impl Row<'_> {
    pub fn put_bool(&mut self, column: usize, value: bool) {
        self.writer.staged[column] = Staged::Bool(value);
    }

    pub fn put_int(&mut self, column: usize, value: i32) {
        self.writer.staged[column] = Staged::Int(value);
    }

    pub fn put_long(&mut self, column: usize, value: i64) {
        self.writer.staged[column] = Staged::Long(value);
    }

    pub fn put_double(&mut self, column: usize, value: f64) {
        self.writer.staged[column] = Staged::Double(value);
    }

    pub fn put_date(&mut self, column: usize, value: i64) {
        self.writer.staged[column] = Staged::Date(value);
    }

    pub fn put_timestamp(&mut self, column: usize, value: i64) {
        self.writer.staged[column] = Staged::Timestamp(value);
    }

    pub fn put_str(&mut self, column: usize, value: &str) {
        self.writer.staged[column] = Staged::Str(value.to_string());
    }

    pub fn put_symbol(&mut self, column: usize, value: &str) {
        self.writer.staged[column] = Staged::Symbol(value.to_string());
    }

    /// Write the staged values to the current partition.
    pub fn append(self) -> Result<()> {
        self.writer.append_staged()
    }

    /// Discard the staged values; no partial row persists.
    pub fn cancel(self) {
        self.writer.cancel_staged();
    }
}
