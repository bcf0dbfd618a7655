//! Import job configuration
//!
//! Enumerated configuration keys for the bulk-import pipeline:
//! worker count, read buffer size, parse-error atomicity, time
//! partitioning scheme, header handling and index block capacity.

use crate::{Result, StrataError};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Default per-task read buffer (64 KB)
pub const DEFAULT_BUFFER_LEN: usize = 64 * 1024;
/// Default value-block capacity for indexed columns
pub const DEFAULT_INDEX_VALUE_BLOCK_CAPACITY: usize = 256;

/// Policy governing how parse errors are handled during import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atomicity {
    /// The offending field becomes NULL; the row is still appended.
    SkipColumn,
    /// The offending row is cancelled; import continues.
    SkipRow,
    /// Any parse error fails the whole job.
    SkipAll,
}

/// Time bucketing scheme for table partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionBy {
    None,
    Hour,
    Day,
    Month,
    Year,
}

impl PartitionBy {
    /// Floor a microsecond timestamp to the start of its partition bucket.
    pub fn floor(&self, timestamp_us: i64) -> i64 {
        let dt = match DateTime::<Utc>::from_timestamp_micros(timestamp_us) {
            Some(dt) => dt,
            None => return timestamp_us,
        };
        let floored = match self {
            PartitionBy::None => return 0,
            PartitionBy::Hour => dt
                .with_minute(0)
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0)),
            PartitionBy::Day => dt
                .with_hour(0)
                .and_then(|d| d.with_minute(0))
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0)),
            PartitionBy::Month => dt
                .with_day(1)
                .and_then(|d| d.with_hour(0))
                .and_then(|d| d.with_minute(0))
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0)),
            PartitionBy::Year => dt
                .with_month(1)
                .and_then(|d| d.with_day(1))
                .and_then(|d| d.with_hour(0))
                .and_then(|d| d.with_minute(0))
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0)),
        };
        floored.map(|d| d.timestamp_micros()).unwrap_or(timestamp_us)
    }

    /// Partition directory name for a microsecond timestamp.
    ///
    /// Names sort lexicographically in chronological order.
    pub fn dir_name(&self, timestamp_us: i64) -> String {
        let dt = match DateTime::<Utc>::from_timestamp_micros(timestamp_us) {
            Some(dt) => dt,
            None => return "default".to_string(),
        };
        match self {
            PartitionBy::None => "default".to_string(),
            PartitionBy::Hour => dt.format("%Y-%m-%dT%H").to_string(),
            PartitionBy::Day => dt.format("%Y-%m-%d").to_string(),
            PartitionBy::Month => dt.format("%Y-%m").to_string(),
            PartitionBy::Year => dt.format("%Y").to_string(),
        }
    }
}

/// Tunables for one import job.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Number of pool threads (>= 1)
    pub worker_count: usize,
    /// Per-task read buffer size in bytes (> 0)
    pub buffer_len: usize,
    /// Parse-error policy
    pub atomicity: Atomicity,
    /// Time partitioning scheme
    pub partition_by: PartitionBy,
    /// Discard the first logical record of the file
    pub ignore_header: bool,
    /// Power-of-two value-block size for indexed columns
    pub index_value_block_capacity: usize,
    /// Keep shadow tables and the import root on failure (debug aid)
    pub keep_artifacts: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            buffer_len: DEFAULT_BUFFER_LEN,
            atomicity: Atomicity::SkipAll,
            partition_by: PartitionBy::Day,
            ignore_header: false,
            index_value_block_capacity: DEFAULT_INDEX_VALUE_BLOCK_CAPACITY,
            keep_artifacts: false,
        }
    }
}

impl ImportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    pub fn atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    pub fn partition_by(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    pub fn ignore_header(mut self, ignore: bool) -> Self {
        self.ignore_header = ignore;
        self
    }

    pub fn index_value_block_capacity(mut self, capacity: usize) -> Self {
        self.index_value_block_capacity = capacity;
        self
    }

    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count < 1 {
            return Err(StrataError::InvalidConfig(
                "worker_count must be >= 1".to_string(),
            ));
        }
        if self.buffer_len == 0 {
            return Err(StrataError::InvalidConfig(
                "buffer_len must be > 0".to_string(),
            ));
        }
        if !self.index_value_block_capacity.is_power_of_two() {
            return Err(StrataError::InvalidConfig(format!(
                "index_value_block_capacity must be a power of two, got {}",
                self.index_value_block_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_dir_names() {
        // 1970-01-01T00:00:36Z
        let ts = 36_000_000i64;
        assert_eq!(PartitionBy::Day.dir_name(ts), "1970-01-01");
        assert_eq!(PartitionBy::Hour.dir_name(ts), "1970-01-01T00");
        assert_eq!(PartitionBy::Month.dir_name(ts), "1970-01");
        assert_eq!(PartitionBy::Year.dir_name(ts), "1970");
        assert_eq!(PartitionBy::None.dir_name(ts), "default");
    }

    #[test]
    fn test_partition_floor() {
        // 2021-06-15T13:45:12.5Z
        let ts = 1_623_764_712_500_000i64;
        let day = PartitionBy::Day.floor(ts);
        assert_eq!(PartitionBy::Day.dir_name(day), "2021-06-15");
        assert_eq!(day % 86_400_000_000, 0);
        let hour = PartitionBy::Hour.floor(ts);
        assert_eq!(hour % 3_600_000_000, 0);
        assert!(hour >= day);
    }

    #[test]
    fn test_config_validation() {
        assert!(ImportConfig::new().validate().is_ok());
        assert!(ImportConfig::new().worker_count(0).validate().is_err());
        assert!(ImportConfig::new().buffer_len(0).validate().is_err());
        assert!(ImportConfig::new()
            .index_value_block_capacity(100)
            .validate()
            .is_err());
        assert!(ImportConfig::new()
            .index_value_block_capacity(128)
            .validate()
            .is_ok());
    }
}
