//! Delimited-text parsing
//!
//! Byte-level machinery for the import pipeline: the quote-parity chunk
//! scanner, the streaming CSV lexer and the per-type field adapters.

mod adapters;
mod lexer;
mod scanner;

pub use adapters::{parse_timestamp, write_field, Utf8Sink};
pub use lexer::{CsvLexer, CsvRecord};
pub use scanner::{scan_chunk, ChunkReader, QuoteCensus};
