//! Table schema definitions
//!
//! The target schema of an import: an ordered list of typed columns, the
//! designated timestamp column and per-column index settings.

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Boolean = 1,
    Int = 2,
    Long = 3,
    Double = 4,
    /// Milliseconds since epoch
    Date = 5,
    /// Microseconds since epoch
    Timestamp = 6,
    Str = 7,
    /// Dictionary-encoded string
    Symbol = 8,
}

impl ColumnType {
    /// Fixed on-disk size in bytes (0 for variable-length types)
    pub fn fixed_size(&self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Int => 4,
            ColumnType::Long => 8,
            ColumnType::Double => 8,
            ColumnType::Date => 8,
            ColumnType::Timestamp => 8,
            ColumnType::Str => 0,
            ColumnType::Symbol => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Int => "INT",
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Str => "STRING",
            ColumnType::Symbol => "SYMBOL",
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// Whether a value-list index is requested for this column
    pub indexed: bool,
    /// Value-block capacity for the index
    pub index_value_block_capacity: usize,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            indexed: false,
            index_value_block_capacity: crate::config::DEFAULT_INDEX_VALUE_BLOCK_CAPACITY,
        }
    }

    /// Request a value-list index with the given block capacity.
    pub fn indexed(mut self, capacity: usize) -> Self {
        self.indexed = true;
        self.index_value_block_capacity = capacity;
        self
    }
}

/// Target table schema for an import job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    /// Index of the designated timestamp column
    pub timestamp_index: usize,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnDef>, timestamp_index: usize) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
            timestamp_index,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Indices of all symbol-typed columns.
    pub fn symbol_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type == ColumnType::Symbol)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of all columns with a requested index.
    pub fn indexed_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.indexed)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StrataError::InvalidConfig(
                "schema must have at least one column".to_string(),
            ));
        }
        if self.timestamp_index >= self.columns.len() {
            return Err(StrataError::InvalidConfig(format!(
                "timestamp index {} out of range for {} columns",
                self.timestamp_index,
                self.columns.len()
            )));
        }
        if self.columns[self.timestamp_index].column_type != ColumnType::Timestamp {
            return Err(StrataError::InvalidConfig(format!(
                "designated timestamp column '{}' is not TIMESTAMP",
                self.columns[self.timestamp_index].name
            )));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if col.indexed && col.column_type != ColumnType::Symbol {
                return Err(StrataError::InvalidConfig(format!(
                    "indexed column '{}' must be SYMBOL",
                    col.name
                )));
            }
            if col.indexed && !col.index_value_block_capacity.is_power_of_two() {
                return Err(StrataError::InvalidConfig(format!(
                    "index capacity for '{}' must be a power of two",
                    col.name
                )));
            }
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(StrataError::InvalidConfig(format!(
                    "duplicate column name '{}'",
                    col.name
                )));
            }
        }
        Ok(())
    }
}
