//! Streaming CSV record lexer
//!
//! Splits delimited text into logical records: one record per physical
//! line, except that `\n` bytes inside a quoted field belong to the field.
//! Quote state survives buffer fills, so a quoted field may span any number
//! of `parse` calls. Inside a quoted field `""` is the only escape for a
//! literal `"`; carriage returns are retained in field bytes.
//!
//! Field bytes are accumulated into an owned record buffer with quotes and
//! escapes already stripped, so a record handed to the sink is always
//! contiguous regardless of how the input was chunked.

use crate::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// One logical record: unescaped field bytes plus provenance.
pub struct CsvRecord<'a> {
    /// Absolute file offset of the first byte of the record
    pub start_offset: u64,
    /// Zero-based absolute line number of the record
    pub line_number: u64,
    content: &'a [u8],
    bounds: &'a [(usize, usize)],
}

impl<'a> CsvRecord<'a> {
    pub fn field_count(&self) -> usize {
        self.bounds.len()
    }

    /// Raw bytes of field `i`; empty slice for an empty field.
    pub fn field(&self, i: usize) -> &'a [u8] {
        let (lo, hi) = self.bounds[i];
        &self.content[lo..hi]
    }
}

/// Delimiter-driven lexer with quote state carried across buffer fills.
pub struct CsvLexer {
    delimiter: u8,
    state: LexState,
    content: Vec<u8>,
    bounds: Vec<(usize, usize)>,
    field_start: usize,
    in_record: bool,
    record_offset: u64,
    quote_open_offset: u64,
    line_number: u64,
    line_count: u64,
    max_line_length: u64,
}

impl CsvLexer {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            state: LexState::FieldStart,
            content: Vec::new(),
            bounds: Vec::new(),
            field_start: 0,
            in_record: false,
            record_offset: 0,
            quote_open_offset: 0,
            line_number: 0,
            line_count: 0,
            max_line_length: 0,
        }
    }

    /// Reset all parse state and counters; the delimiter is kept.
    pub fn clear(&mut self) {
        self.state = LexState::FieldStart;
        self.content.clear();
        self.bounds.clear();
        self.field_start = 0;
        self.in_record = false;
        self.record_offset = 0;
        self.quote_open_offset = 0;
        self.line_number = 0;
        self.line_count = 0;
    }

    /// First emitted record gets this absolute line number.
    pub fn set_starting_line(&mut self, line: u64) {
        self.line_number = line;
    }

    /// Records emitted since the last `clear`.
    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    /// Longest complete record seen, in raw source bytes.
    pub fn max_line_length(&self) -> u64 {
        self.max_line_length
    }

    /// Feed a buffer of input starting at absolute file offset
    /// `base_offset`. The sink returns `Ok(false)` to stop consuming;
    /// `parse` then returns `Ok(false)` with the rest of the buffer
    /// unconsumed and the lexer ready for a fresh record.
    pub fn parse<F>(&mut self, input: &[u8], base_offset: u64, sink: &mut F) -> Result<bool>
    where
        F: FnMut(&CsvRecord<'_>) -> Result<bool>,
    {
        for (i, &c) in input.iter().enumerate() {
            let abs = base_offset + i as u64;
            if !self.in_record {
                self.in_record = true;
                self.record_offset = abs;
            }
            match self.state {
                LexState::FieldStart => {
                    if c == b'"' {
                        self.quote_open_offset = abs;
                        self.state = LexState::Quoted;
                    } else if c == self.delimiter {
                        self.close_field();
                    } else if c == b'\n' {
                        self.close_field();
                        if !self.emit(abs + 1, sink)? {
                            return Ok(false);
                        }
                    } else {
                        self.content.push(c);
                        self.state = LexState::Unquoted;
                    }
                }
                LexState::Unquoted => {
                    if c == self.delimiter {
                        self.close_field();
                        self.state = LexState::FieldStart;
                    } else if c == b'\n' {
                        self.close_field();
                        self.state = LexState::FieldStart;
                        if !self.emit(abs + 1, sink)? {
                            return Ok(false);
                        }
                    } else {
                        self.content.push(c);
                    }
                }
                LexState::Quoted => {
                    if c == b'"' {
                        self.state = LexState::QuoteInQuoted;
                    } else {
                        self.content.push(c);
                    }
                }
                LexState::QuoteInQuoted => {
                    if c == b'"' {
                        // escaped literal quote
                        self.content.push(b'"');
                        self.state = LexState::Quoted;
                    } else if c == self.delimiter {
                        self.close_field();
                        self.state = LexState::FieldStart;
                    } else if c == b'\n' {
                        self.close_field();
                        self.state = LexState::FieldStart;
                        if !self.emit(abs + 1, sink)? {
                            return Ok(false);
                        }
                    } else {
                        // closing quote followed by stray bytes: field
                        // continues unquoted
                        self.content.push(c);
                        self.state = LexState::Unquoted;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Flush the final record of the input, if any. The last line of a file
    /// needs no trailing newline; end of input inside an open quote is an
    /// error.
    pub fn finish<F>(&mut self, end_offset: u64, sink: &mut F) -> Result<()>
    where
        F: FnMut(&CsvRecord<'_>) -> Result<bool>,
    {
        if !self.in_record {
            return Ok(());
        }
        if self.state == LexState::Quoted {
            return Err(StrataError::UnterminatedQuote {
                offset: self.quote_open_offset,
            });
        }
        self.close_field();
        self.state = LexState::FieldStart;
        self.emit(end_offset, sink)?;
        Ok(())
    }

    fn close_field(&mut self) {
        self.bounds.push((self.field_start, self.content.len()));
        self.field_start = self.content.len();
    }

    fn emit<F>(&mut self, end_offset: u64, sink: &mut F) -> Result<bool>
    where
        F: FnMut(&CsvRecord<'_>) -> Result<bool>,
    {
        let raw_len = end_offset - self.record_offset;
        if raw_len > self.max_line_length {
            self.max_line_length = raw_len;
        }
        let record = CsvRecord {
            start_offset: self.record_offset,
            line_number: self.line_number,
            content: &self.content,
            bounds: &self.bounds,
        };
        let more = sink(&record)?;
        self.line_number += 1;
        self.line_count += 1;
        self.content.clear();
        self.bounds.clear();
        self.field_start = 0;
        self.in_record = false;
        Ok(more)
    }
}
