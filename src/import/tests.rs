//! End-to-end import pipeline tests

use crate::config::{Atomicity, ImportConfig, PartitionBy};
use crate::engine::Engine;
use crate::import::{import_csv, CircuitBreaker, CsvImportJob, JobStatus};
use crate::schema::{ColumnDef, ColumnType, TableSchema};
use crate::{Result, StrataError};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn write_csv(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    // surface pipeline log lines under RUST_LOG
    let _ = env_logger::try_init();
    let path = dir.path().join(name);
    let mut f = fs::File::create(&path).unwrap();
    f.write_all(content).unwrap();
    path
}

fn sensors_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            ColumnDef::new("sensor_id", ColumnType::Symbol),
            ColumnDef::new("temperature", ColumnType::Int),
            ColumnDef::new("ts", ColumnType::Timestamp),
        ],
        2,
    )
}

fn notes_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            ColumnDef::new("sensor_id", ColumnType::Symbol),
            ColumnDef::new("note", ColumnType::Str),
            ColumnDef::new("ts", ColumnType::Timestamp),
        ],
        2,
    )
}

#[test]
fn test_three_rows_one_partition() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"sensor_id,temperature,ts\n\
          ALPHA,10,1970-01-01T00:00:00.000000Z\n\
          ALPHA,11,1970-01-01T00:00:36.000000Z\n\
          OMEGA,12,1970-01-01T00:01:12.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors")).config(
        ImportConfig::new()
            .worker_count(1)
            .partition_by(PartitionBy::Day)
            .ignore_header(true),
    );

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.errors, 0);
    assert_eq!(
        result.imported_rows_per_partition.get("1970-01-01"),
        Some(&3)
    );

    let reader = engine.reader("sensors").unwrap();
    assert_eq!(reader.meta().partition_row_count("1970-01-01"), Some(3));
    // dictionary holds first-seen order
    assert_eq!(
        reader.handle().symbol_names("sensor_id").unwrap(),
        vec!["ALPHA", "OMEGA"]
    );
    assert_eq!(
        reader
            .handle()
            .read_symbol_column("1970-01-01", "sensor_id")
            .unwrap(),
        vec![
            Some("ALPHA".to_string()),
            Some("ALPHA".to_string()),
            Some("OMEGA".to_string())
        ]
    );
    assert_eq!(
        reader
            .handle()
            .read_int_column("1970-01-01", "temperature")
            .unwrap(),
        vec![Some(10), Some(11), Some(12)]
    );
    assert_eq!(
        reader.handle().read_long_column("1970-01-01", "ts").unwrap(),
        vec![Some(0), Some(36_000_000), Some(72_000_000)]
    );
    // the import root is gone on success
    assert!(!dir.path().join("db").join(".import_sensors").exists());
}

#[test]
fn test_quoted_newline_field() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "notes.csv",
        b"ALPHA,\"line1\nline2\",1970-01-01T00:00:00.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, notes_schema("notes"))
        .config(ImportConfig::new().worker_count(1));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.imported_rows(), 1);

    let reader = engine.reader("notes").unwrap();
    assert_eq!(
        reader.handle().read_str_column("1970-01-01", "note").unwrap(),
        vec![Some("line1\nline2".to_string())]
    );
}

/// Build a CSV where most rows carry a quoted, newline-bearing field, so
/// that tentative chunk boundaries routinely land inside quotes.
fn quoted_corpus(rows: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..rows {
        let day = i % 3 + 1;
        let secs = (i * 7) % 86_000;
        out.extend_from_slice(
            format!(
                "SYM_{},\"line one {}\nline two with, commas and \"\"quotes\"\" {}\",1970-01-0{}T{:02}:{:02}:{:02}.000000Z\n",
                i % 11,
                i,
                "x".repeat(i % 37),
                day,
                secs / 3600,
                secs % 3600 / 60,
                secs % 60,
            )
            .as_bytes(),
        );
    }
    out
}

fn import_corpus(worker_count: usize, table: &str, dir: &TempDir, source: &PathBuf) -> crate::import::JobResult {
    let schema = notes_schema(table);
    let engine = Engine::new(dir.path().join(format!("db_{table}"))).unwrap();
    let job = CsvImportJob::new(source.clone(), schema)
        .config(ImportConfig::new().worker_count(worker_count).buffer_len(256));
    import_csv(&engine, &job).unwrap()
}

#[test]
fn test_parallel_import_matches_single_threaded() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "corpus.csv", &quoted_corpus(211));

    let single = import_corpus(1, "t1", &dir, &source);
    let parallel = import_corpus(4, "t4", &dir, &source);

    assert_eq!(single.status, JobStatus::Ok);
    assert_eq!(parallel.status, JobStatus::Ok);
    assert_eq!(single.errors, parallel.errors);
    assert_eq!(
        single.imported_rows_per_partition,
        parallel.imported_rows_per_partition
    );
    assert_eq!(single.imported_rows(), 211);
}

#[test]
fn test_skip_row_with_bad_timestamp() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"ALPHA,10,1970-01-01T00:00:00.000000Z\n\
          ALPHA,11,not-a-date\n\
          OMEGA,12,1970-01-01T00:01:12.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"))
        .config(ImportConfig::new().atomicity(Atomicity::SkipRow));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.errors, 1);
    assert_eq!(result.imported_rows(), 2);

    let reader = engine.reader("sensors").unwrap();
    assert_eq!(reader.meta().partition_row_count("1970-01-01"), Some(2));
    assert_eq!(
        reader
            .handle()
            .read_int_column("1970-01-01", "temperature")
            .unwrap(),
        vec![Some(10), Some(12)]
    );
}

#[test]
fn test_skip_all_with_bad_field() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"ALPHA,10,1970-01-01T00:00:00.000000Z\n\
          ALPHA,cold,1970-01-01T00:00:36.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"))
        .config(ImportConfig::new().atomicity(Atomicity::SkipAll));

    let result = import_csv(&engine, &job).unwrap();
    match &result.status {
        JobStatus::Failed(message) => {
            assert!(message.contains("column=1"), "got: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // no artifacts survive a failed job
    assert!(!dir.path().join("db").join(".import_sensors").exists());
    assert!(matches!(
        engine.reader("sensors"),
        Err(StrataError::TableNotFound(_))
    ));
}

#[test]
fn test_skip_column_nulls_bad_field() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"ALPHA,10,1970-01-01T00:00:00.000000Z\n\
          ALPHA,cold,1970-01-01T00:00:36.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"))
        .config(ImportConfig::new().atomicity(Atomicity::SkipColumn));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.errors, 1);
    assert_eq!(result.imported_rows(), 2);

    let reader = engine.reader("sensors").unwrap();
    assert_eq!(
        reader
            .handle()
            .read_int_column("1970-01-01", "temperature")
            .unwrap(),
        vec![Some(10), None]
    );
}

#[test]
fn test_symbol_key_remap_across_workers() {
    let dir = tempdir().unwrap();
    // two partitions, sliced one per worker:
    // worker 0 sees A then B, worker 1 sees B then C
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"A,1,1970-01-01T00:00:00.000000Z\n\
          B,2,1970-01-01T00:00:01.000000Z\n\
          B,3,1970-01-02T00:00:00.000000Z\n\
          C,4,1970-01-02T00:00:01.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"))
        .config(ImportConfig::new().worker_count(2));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);

    let reader = engine.reader("sensors").unwrap();
    assert_eq!(
        reader.handle().symbol_names("sensor_id").unwrap(),
        vec!["A", "B", "C"]
    );
    // keys were rewritten through the remap: B is 1 in both partitions
    assert_eq!(
        reader
            .handle()
            .read_symbol_keys("1970-01-01", "sensor_id")
            .unwrap(),
        vec![0, 1]
    );
    assert_eq!(
        reader
            .handle()
            .read_symbol_keys("1970-01-02", "sensor_id")
            .unwrap(),
        vec![1, 2]
    );
    assert_eq!(
        reader
            .handle()
            .read_symbol_column("1970-01-02", "sensor_id")
            .unwrap(),
        vec![Some("B".to_string()), Some("C".to_string())]
    );
}

#[test]
fn test_indexed_column_read_back() {
    let dir = tempdir().unwrap();
    let schema = TableSchema::new(
        "sensors",
        vec![
            ColumnDef::new("sensor_id", ColumnType::Symbol).indexed(32),
            ColumnDef::new("temperature", ColumnType::Int),
            ColumnDef::new("ts", ColumnType::Timestamp),
        ],
        2,
    );
    let source = write_csv(
        &dir,
        "sensors.csv",
        b"ALPHA,1,1970-01-01T00:00:00.000000Z\n\
          OMEGA,2,1970-01-01T00:00:01.000000Z\n\
          ALPHA,3,1970-01-02T00:00:00.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, schema).config(ImportConfig::new().worker_count(2));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);

    let reader = engine.reader("sensors").unwrap();
    let column_index = reader.meta().schema.column_index("sensor_id").unwrap();
    assert!(reader.meta().is_column_indexed(column_index));
    assert_eq!(reader.meta().index_value_block_capacity(column_index), 32);
    let mut index_files = 0;
    for partition in reader.handle().partition_names() {
        let pdir = reader.handle().table_dir().join(partition);
        if pdir.join("sensor_id.k").exists() {
            index_files += 1;
        }
        if pdir.join("sensor_id.v").exists() {
            index_files += 1;
        }
    }
    assert!(index_files >= 2, "expected index files, found {index_files}");
}

#[test]
fn test_zero_byte_file() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "empty.csv", b"");
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.imported_rows(), 0);

    let reader = engine.reader("sensors").unwrap();
    assert!(reader.meta().partitions.is_empty());
}

#[test]
fn test_single_row_no_trailing_newline() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "one.csv", b"ALPHA,10,1970-01-01T00:00:00.000000Z");
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.imported_rows(), 1);
}

#[test]
fn test_file_ending_inside_quote_fails() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "bad.csv",
        b"ALPHA,\"unterminated,1970-01-01T00:00:00.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, notes_schema("notes"));

    let result = import_csv(&engine, &job).unwrap();
    match &result.status {
        JobStatus::Failed(message) => {
            assert!(message.contains("quoted field"), "got: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_cancel_before_start_writes_nothing() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "sensors.csv", b"ALPHA,1,1970-01-01T00:00:00.000000Z\n");
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let breaker = Arc::new(CircuitBreaker::new());
    breaker.trip();
    let job =
        CsvImportJob::new(source, sensors_schema("sensors")).circuit_breaker(Arc::clone(&breaker));

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(matches!(
        engine.reader("sensors"),
        Err(StrataError::TableNotFound(_))
    ));
    assert!(!dir.path().join("db").join(".import_sensors").exists());
}

#[test]
fn test_rerun_is_deterministic() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "corpus.csv", &quoted_corpus(97));

    let first = import_corpus(3, "a", &dir, &source);
    let second = import_corpus(3, "b", &dir, &source);
    assert_eq!(first.status, JobStatus::Ok);
    assert_eq!(
        first.imported_rows_per_partition,
        second.imported_rows_per_partition
    );
}

#[test]
fn test_semicolon_delimiter() {
    let dir = tempdir().unwrap();
    let source = write_csv(
        &dir,
        "semi.csv",
        b"ALPHA;10;1970-01-01T00:00:00.000000Z\nOMEGA;11;1970-01-01T00:00:01.000000Z\n",
    );
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors")).delimiter(b';');

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.imported_rows(), 2);
}

#[test]
fn test_header_skipped_once_with_many_workers() {
    let dir = tempdir().unwrap();
    let mut content = b"sensor_id,temperature,ts\n".to_vec();
    for i in 0..50 {
        content.extend_from_slice(
            format!("S{},{},1970-01-01T00:00:{:02}.000000Z\n", i % 5, i, i % 60).as_bytes(),
        );
    }
    let source = write_csv(&dir, "wide.csv", &content);
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors")).config(
        ImportConfig::new()
            .worker_count(4)
            .ignore_header(true)
            .buffer_len(64),
    );

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(result.errors, 0);
    assert_eq!(result.imported_rows(), 50);
}

#[test]
fn test_custom_timestamp_parser() {
    fn epoch_seconds(bytes: &[u8]) -> Result<i64> {
        let parsed = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        match parsed {
            Some(secs) => Ok(secs * 1_000_000),
            None => Err(StrataError::BadTimestamp { offset: 0, line: 0 }),
        }
    }

    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "epoch.csv", b"ALPHA,1,0\nOMEGA,2,86400\n");
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors")).timestamp_parser(epoch_seconds);

    let result = import_csv(&engine, &job).unwrap();
    assert_eq!(result.status, JobStatus::Ok);
    assert_eq!(
        result.imported_rows_per_partition.get("1970-01-02"),
        Some(&1)
    );
}

fn import_result(engine: &Engine, job: &CsvImportJob) -> Result<crate::import::JobResult> {
    import_csv(engine, job)
}

#[test]
fn test_duplicate_table_rejected_before_pipeline() {
    let dir = tempdir().unwrap();
    let source = write_csv(&dir, "sensors.csv", b"ALPHA,1,1970-01-01T00:00:00.000000Z\n");
    let engine = Engine::new(dir.path().join("db")).unwrap();
    let job = CsvImportJob::new(source, sensors_schema("sensors"));

    assert_eq!(import_result(&engine, &job).unwrap().status, JobStatus::Ok);
    assert!(matches!(
        import_result(&engine, &job),
        Err(StrataError::TableExists(_))
    ));
}
