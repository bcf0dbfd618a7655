//! Native columnar table storage
//!
//! On-disk layout of one table:
//! ```text
//! <table>/
//!   _meta                     table metadata (bincode + crc32)
//!   <symbolCol>.sym           symbol dictionary, entries in key order
//!   <symbolCol>.r             local-key -> final-key remap (i32 array)
//!   <partition>/
//!     <col>.d                 column data, fixed width or length-prefixed
//!     <indexedCol>.k          value-list index keys
//!     <indexedCol>.v          value-list index row ids
//! ```
//!
//! NULL sentinels per column type: LONG/TIMESTAMP/DATE `i64::MIN`,
//! INT `i32::MIN`, DOUBLE `NaN`, BOOLEAN `false`, SYMBOL key `-1`,
//! STRING length `u32::MAX`.

mod index_builder;
mod meta;
mod reader;
mod symbol;
mod writer;

pub use index_builder::build_value_index;
pub use meta::{PartitionMeta, TableMeta, META_FILE_NAME};
pub use reader::TableHandle;
pub use symbol::{
    merge_symbols, update_symbol_keys, SymbolDictionary, SymbolMapReader, SymbolMapWriter,
    KEY_REMAP_FILE_SUFFIX, SYMBOL_FILE_SUFFIX,
};
pub use writer::{Row, TableWriter};

/// Suffix of column data files
pub const COLUMN_FILE_SUFFIX: &str = ".d";
/// Suffix of value-list index key files
pub const INDEX_KEY_FILE_SUFFIX: &str = ".k";
/// Suffix of value-list index value files
pub const INDEX_VALUE_FILE_SUFFIX: &str = ".v";

/// NULL sentinel for INT columns
pub const NULL_INT: i32 = i32::MIN;
/// NULL sentinel for LONG/TIMESTAMP/DATE columns
pub const NULL_LONG: i64 = i64::MIN;
/// NULL sentinel for SYMBOL keys
pub const NULL_SYMBOL_KEY: i32 = -1;
/// NULL sentinel for STRING lengths
pub const NULL_STR_LEN: u32 = u32::MAX;
