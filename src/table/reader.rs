//! Column read-back
//!
//! Read side of the native layout, used to verify imports and to serve
//! engine readers. Columns are materialized whole; NULL sentinels decode
//! to `None`.

use crate::schema::ColumnType;
use crate::table::{
    SymbolMapReader, TableMeta, COLUMN_FILE_SUFFIX, NULL_INT, NULL_LONG, NULL_STR_LEN,
};
use crate::{Result, StrataError};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Read-only handle on one table directory.
pub struct TableHandle {
    table_dir: PathBuf,
    meta: TableMeta,
}

impl TableHandle {
    pub fn open(table_dir: impl Into<PathBuf>) -> Result<Self> {
        let table_dir = table_dir.into();
        let meta = TableMeta::load(&table_dir)?;
        Ok(Self { table_dir, meta })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.meta.partitions.iter().map(|p| p.name.clone()).collect()
    }

    fn column_reader(&self, partition: &str, column: &str) -> Result<BufReader<File>> {
        let path = self
            .table_dir
            .join(partition)
            .join(format!("{column}{COLUMN_FILE_SUFFIX}"));
        let file = File::open(&path).map_err(|e| StrataError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        Ok(BufReader::new(file))
    }

    fn column_type(&self, column: &str) -> Result<ColumnType> {
        self.meta
            .schema
            .column_index(column)
            .map(|i| self.meta.schema.columns[i].column_type)
            .ok_or_else(|| StrataError::Corrupt(format!("unknown column '{column}'")))
    }

    /// LONG, TIMESTAMP or DATE column.
    pub fn read_long_column(&self, partition: &str, column: &str) -> Result<Vec<Option<i64>>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            let v = r.read_i64::<LittleEndian>()?;
            out.push(if v == NULL_LONG { None } else { Some(v) });
        }
        Ok(out)
    }

    pub fn read_int_column(&self, partition: &str, column: &str) -> Result<Vec<Option<i32>>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            let v = r.read_i32::<LittleEndian>()?;
            out.push(if v == NULL_INT { None } else { Some(v) });
        }
        Ok(out)
    }

    pub fn read_double_column(&self, partition: &str, column: &str) -> Result<Vec<Option<f64>>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            let v = r.read_f64::<LittleEndian>()?;
            out.push(if v.is_nan() { None } else { Some(v) });
        }
        Ok(out)
    }

    pub fn read_bool_column(&self, partition: &str, column: &str) -> Result<Vec<bool>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            out.push(r.read_u8()? != 0);
        }
        Ok(out)
    }

    pub fn read_str_column(&self, partition: &str, column: &str) -> Result<Vec<Option<String>>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            let len = r.read_u32::<LittleEndian>()?;
            if len == NULL_STR_LEN {
                out.push(None);
                continue;
            }
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf)?;
            let s = String::from_utf8(buf)
                .map_err(|_| StrataError::Corrupt("invalid UTF-8 in string column".to_string()))?;
            out.push(Some(s));
        }
        Ok(out)
    }

    /// Raw dictionary keys of a symbol column, NULLs included as -1.
    pub fn read_symbol_keys(&self, partition: &str, column: &str) -> Result<Vec<i32>> {
        let rows = self.rows_in(partition)?;
        let mut r = self.column_reader(partition, column)?;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            out.push(r.read_i32::<LittleEndian>()?);
        }
        Ok(out)
    }

    /// Dictionary entries of a symbol column, in key order.
    pub fn symbol_names(&self, column: &str) -> Result<Vec<String>> {
        debug_assert_eq!(self.column_type(column)?, ColumnType::Symbol);
        let mut reader = SymbolMapReader::open(&self.table_dir, column)?;
        let mut out = Vec::new();
        while let Some(name) = reader.next_symbol()? {
            out.push(name);
        }
        Ok(out)
    }

    /// Symbol column resolved through the table's dictionary.
    pub fn read_symbol_column(&self, partition: &str, column: &str) -> Result<Vec<Option<String>>> {
        let names = self.symbol_names(column)?;
        let keys = self.read_symbol_keys(partition, column)?;
        keys.into_iter()
            .map(|k| {
                if k < 0 {
                    Ok(None)
                } else {
                    names
                        .get(k as usize)
                        .cloned()
                        .map(Some)
                        .ok_or_else(|| {
                            StrataError::Corrupt(format!(
                                "symbol key {k} out of range for column '{column}'"
                            ))
                        })
                }
            })
            .collect()
    }

    fn rows_in(&self, partition: &str) -> Result<usize> {
        self.meta
            .partition_row_count(partition)
            .map(|n| n as usize)
            .ok_or_else(|| StrataError::Corrupt(format!("unknown partition '{partition}'")))
    }
}
