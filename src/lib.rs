//! StrataDB Core Storage Engine
//!
//! A columnar, time-partitioned analytical storage engine implemented in Rust.
//! The centerpiece is a parallel CSV bulk-import pipeline that materializes
//! very large delimited files into the native columnar format using a pool
//! of worker tasks.

pub mod config;
pub mod engine;
pub mod import;
pub mod index;
pub mod schema;
pub mod table;
pub mod text;

// Re-export main types
pub use config::{Atomicity, ImportConfig, PartitionBy};
pub use engine::{Engine, TableReader};
pub use import::{import_csv, CircuitBreaker, CsvImportJob, JobResult, JobStatus};
pub use schema::{ColumnDef, ColumnType, TableSchema};

use std::path::PathBuf;

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot open file: {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read file: {path} at offset {offset}: {source}")]
    ReadFailed {
        path: PathBuf,
        offset: u64,
        source: std::io::Error,
    },

    #[error("Cannot parse timestamp [line={line}, offset={offset}]")]
    BadTimestamp { offset: u64, line: u64 },

    #[error("Bad field syntax [line offset={offset}, column={column}]")]
    BadField { offset: u64, column: usize },

    #[error("Unterminated quoted field starting at offset {offset}")]
    UnterminatedQuote { offset: u64 },

    #[error("Task is cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Symbol key remap undersized [column={column}, symbols={symbols}, referenced key={referenced}]")]
    RemapUndersized {
        column: String,
        symbols: usize,
        referenced: i32,
    },

    #[error("Symbol dictionary overflow [column={column}]")]
    SymbolOverflow { column: String },

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Cached reader cannot be used because table has changed [table='{table_name}', expectedTableId={expected_id}, actualTableId={actual_id}, expectedTableVersion={expected_version}, actualTableVersion={actual_version}]")]
    ReaderOutOfDate {
        table_name: String,
        expected_id: u32,
        actual_id: u32,
        expected_version: u64,
        actual_version: u64,
    },

    #[error("Corrupt table data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
