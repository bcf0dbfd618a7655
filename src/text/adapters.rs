//! Per-type field adapters
//!
//! Convert raw field bytes into typed values staged on an in-flight row.
//! The timestamp adapter is separate because the designated timestamp is
//! consumed when the row is constructed and never re-parsed as a field.
//!
//! String-like types (STRING, SYMBOL, TIMESTAMP, DATE) decode through a
//! reusable UTF-8 scratch buffer; numeric types parse straight from the
//! raw bytes.

use crate::schema::ColumnType;
use crate::table::Row;
use crate::{Result, StrataError};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Reusable UTF-8 decoding scratch buffer.
pub struct Utf8Sink {
    buf: String,
}

impl Utf8Sink {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Validate `bytes` as UTF-8 into the scratch buffer and return it.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<&str> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| StrataError::Corrupt("invalid UTF-8 in field".to_string()))?;
        self.buf.clear();
        self.buf.push_str(s);
        Ok(&self.buf)
    }
}

impl Default for Utf8Sink {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an ISO-8601 timestamp into microseconds since epoch.
///
/// Accepts an RFC 3339 instant (`1970-01-01T00:00:36.000000Z`), a naive
/// date-time taken as UTC, or a bare date taken as UTC midnight.
pub fn parse_timestamp(bytes: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(bytes).map_err(|_| bad_timestamp())?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_micros());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.and_utc().timestamp_micros());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_micros())
            .unwrap_or(0));
    }
    Err(bad_timestamp())
}

fn bad_timestamp() -> StrataError {
    StrataError::BadTimestamp { offset: 0, line: 0 }
}

/// Parse a DATE field into milliseconds since epoch.
fn parse_date_millis(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

fn parse_bool(bytes: &[u8]) -> Option<bool> {
    if bytes.eq_ignore_ascii_case(b"true") {
        Some(true)
    } else if bytes.eq_ignore_ascii_case(b"false") {
        Some(false)
    } else {
        None
    }
}

/// Parse field `bytes` as `column_type` and stage the value on the row.
///
/// The error carries the field index; the caller supplies line and offset
/// context and applies the configured atomicity.
pub fn write_field(
    row: &mut Row<'_>,
    field_index: usize,
    column_type: ColumnType,
    bytes: &[u8],
    utf8_sink: &mut Utf8Sink,
) -> Result<()> {
    let bad = || StrataError::BadField {
        offset: 0,
        column: field_index,
    };
    match column_type {
        ColumnType::Boolean => {
            let v = parse_bool(bytes).ok_or_else(bad)?;
            row.put_bool(field_index, v);
        }
        ColumnType::Int => {
            let s = std::str::from_utf8(bytes).map_err(|_| bad())?;
            let v: i32 = s.parse().map_err(|_| bad())?;
            row.put_int(field_index, v);
        }
        ColumnType::Long => {
            let s = std::str::from_utf8(bytes).map_err(|_| bad())?;
            let v: i64 = s.parse().map_err(|_| bad())?;
            row.put_long(field_index, v);
        }
        ColumnType::Double => {
            let s = std::str::from_utf8(bytes).map_err(|_| bad())?;
            let v: f64 = s.parse().map_err(|_| bad())?;
            row.put_double(field_index, v);
        }
        ColumnType::Date => {
            let s = utf8_sink.decode(bytes).map_err(|_| bad())?;
            let v = parse_date_millis(s).ok_or_else(bad)?;
            row.put_date(field_index, v);
        }
        ColumnType::Timestamp => {
            let s = utf8_sink.decode(bytes).map_err(|_| bad())?;
            let v = parse_timestamp(s.as_bytes()).map_err(|_| bad())?;
            row.put_timestamp(field_index, v);
        }
        ColumnType::Str => {
            let s = utf8_sink.decode(bytes).map_err(|_| bad())?;
            row.put_str(field_index, s);
        }
        ColumnType::Symbol => {
            let s = utf8_sink.decode(bytes).map_err(|_| bad())?;
            row.put_symbol(field_index, s);
        }
    }
    Ok(())
}
