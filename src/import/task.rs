//! Import tasks
//!
//! Each pipeline phase is a variant of [`ImportTask`]; workers call a
//! uniform [`ImportTask::run`] that dispatches on the variant. Tasks are
//! passive values: they either complete or fail, and the only suspension
//! points are blocking reads. The shared circuit breaker is checked at
//! task entry and, for the row loops of the indexing and partition-import
//! phases, every [`CANCEL_CHECK_INTERVAL`] rows.
//!
//! Any panic escaping a phase implementation is caught at the `run`
//! boundary and reported as an error status.

use crate::config::{Atomicity, ImportConfig};
use crate::index::{merge_partition_index, IndexChunkWriter};
use crate::schema::TableSchema;
use crate::table::{
    build_value_index, merge_symbols, update_symbol_keys, SymbolMapWriter, TableMeta, TableWriter,
    COLUMN_FILE_SUFFIX, KEY_REMAP_FILE_SUFFIX,
};
use crate::text::{
    scan_chunk, write_field, ChunkReader, CsvLexer, CsvRecord, QuoteCensus, Utf8Sink,
};
use crate::{Result, StrataError};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows between cooperative cancellation checks in long loops
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Shared cancellation flag, checked cooperatively by tasks.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
        }
    }

    /// Trip the breaker; idempotent and thread-safe.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// Pipeline phase identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImportPhase {
    BoundaryCheck = 1,
    Indexing = 2,
    PartitionImport = 3,
    SymbolTableMerge = 4,
    UpdateSymbolKeys = 5,
    BuildIndex = 6,
}

impl ImportPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ImportPhase::BoundaryCheck => "BOUNDARY_CHECK",
            ImportPhase::Indexing => "INDEXING",
            ImportPhase::PartitionImport => "PARTITION_IMPORT",
            ImportPhase::SymbolTableMerge => "SYMBOL_TABLE_MERGE",
            ImportPhase::UpdateSymbolKeys => "UPDATE_SYMBOL_KEYS",
            ImportPhase::BuildIndex => "BUILD_INDEX",
        }
    }
}

/// Task completion status. `OK = 0`, `ERROR = 1`, `CANCEL = 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    Error(String),
    Cancelled,
}

impl TaskStatus {
    pub fn code(&self) -> u8 {
        match self {
            TaskStatus::Ok => 0,
            TaskStatus::Error(_) => 1,
            TaskStatus::Cancelled => 2,
        }
    }
}

/// Phase-specific task output, aggregated by the coordinator.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    None,
    Census(QuoteCensus),
    Indexed {
        max_line_length: u64,
        partition_keys: Vec<String>,
        errors: u64,
    },
    Imported {
        rows_per_partition: Vec<(String, u64)>,
        errors: u64,
    },
    SymbolsMerged {
        column_index: usize,
        final_count: u64,
    },
}

#[derive(Debug)]
pub struct TaskResult {
    pub phase: ImportPhase,
    pub status: TaskStatus,
    pub output: TaskOutput,
}

/// Inputs shared by every task of one job.
pub struct ImportContext {
    pub source_path: PathBuf,
    pub import_root: PathBuf,
    pub final_table_dir: PathBuf,
    pub schema: TableSchema,
    pub config: ImportConfig,
    pub delimiter: u8,
    /// Caller-supplied parser for the designated timestamp column
    pub timestamp_parser: fn(&[u8]) -> Result<i64>,
}

impl ImportContext {
    fn shadow_table_name(&self, worker: usize) -> String {
        format!("{}_{}", self.schema.table_name, worker)
    }

    pub fn shadow_table_dir(&self, worker: usize) -> PathBuf {
        self.import_root.join(self.shadow_table_name(worker))
    }
}

/// One unit of work, tagged with its phase.
pub enum ImportTask {
    BoundaryCheck {
        ctx: Arc<ImportContext>,
        lo: u64,
        hi: u64,
    },
    Indexing {
        ctx: Arc<ImportContext>,
        chunk_index: usize,
        lo: u64,
        hi: u64,
        starting_line: u64,
        skip_header: bool,
    },
    PartitionImport {
        ctx: Arc<ImportContext>,
        worker: usize,
        partitions: Vec<String>,
        max_line_length: u64,
    },
    SymbolTableMerge {
        ctx: Arc<ImportContext>,
        column_index: usize,
        shadow_workers: Vec<usize>,
    },
    UpdateSymbolKeys {
        ctx: Arc<ImportContext>,
        worker: usize,
        partition: String,
        column_index: usize,
        row_count: u64,
        symbol_count: u64,
    },
    BuildIndex {
        ctx: Arc<ImportContext>,
        worker: usize,
        column_index: usize,
        capacity: usize,
    },
}

impl ImportTask {
    pub fn phase(&self) -> ImportPhase {
        match self {
            ImportTask::BoundaryCheck { .. } => ImportPhase::BoundaryCheck,
            ImportTask::Indexing { .. } => ImportPhase::Indexing,
            ImportTask::PartitionImport { .. } => ImportPhase::PartitionImport,
            ImportTask::SymbolTableMerge { .. } => ImportPhase::SymbolTableMerge,
            ImportTask::UpdateSymbolKeys { .. } => ImportPhase::UpdateSymbolKeys,
            ImportTask::BuildIndex { .. } => ImportPhase::BuildIndex,
        }
    }

    /// Execute the task. Never panics; never blocks on anything but I/O.
    pub fn run(self, breaker: &CircuitBreaker) -> TaskResult {
        let phase = self.phase();
        if breaker.is_tripped() {
            return TaskResult {
                phase,
                status: TaskStatus::Cancelled,
                output: TaskOutput::None,
            };
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(breaker)));
        let (status, output) = match outcome {
            Ok(Ok(output)) => (TaskStatus::Ok, output),
            Ok(Err(StrataError::Cancelled)) => (TaskStatus::Cancelled, TaskOutput::None),
            Ok(Err(e)) => {
                log::error!("import error in {} phase: {}", phase.name(), e);
                (TaskStatus::Error(e.to_string()), TaskOutput::None)
            }
            Err(panic) => {
                let msg = panic_message(panic);
                log::error!("import error in {} phase: {}", phase.name(), msg);
                (TaskStatus::Error(msg), TaskOutput::None)
            }
        };
        TaskResult {
            phase,
            status,
            output,
        }
    }

    fn execute(self, breaker: &CircuitBreaker) -> Result<TaskOutput> {
        match self {
            ImportTask::BoundaryCheck { ctx, lo, hi } => {
                let census = scan_chunk(&ctx.source_path, lo, hi, ctx.config.buffer_len)?;
                Ok(TaskOutput::Census(census))
            }
            ImportTask::Indexing {
                ctx,
                chunk_index,
                lo,
                hi,
                starting_line,
                skip_header,
            } => run_indexing(&ctx, breaker, chunk_index, lo, hi, starting_line, skip_header),
            ImportTask::PartitionImport {
                ctx,
                worker,
                partitions,
                max_line_length,
            } => run_partition_import(&ctx, breaker, worker, &partitions, max_line_length),
            ImportTask::SymbolTableMerge {
                ctx,
                column_index,
                shadow_workers,
            } => run_symbol_table_merge(&ctx, column_index, &shadow_workers),
            ImportTask::UpdateSymbolKeys {
                ctx,
                worker,
                partition,
                column_index,
                row_count,
                symbol_count,
            } => {
                let column = &ctx.schema.columns[column_index].name;
                let shadow_dir = ctx.shadow_table_dir(worker);
                update_symbol_keys(
                    &shadow_dir
                        .join(&partition)
                        .join(format!("{column}{COLUMN_FILE_SUFFIX}")),
                    &shadow_dir.join(format!("{column}{KEY_REMAP_FILE_SUFFIX}")),
                    row_count,
                    symbol_count,
                    column,
                )?;
                Ok(TaskOutput::None)
            }
            ImportTask::BuildIndex {
                ctx,
                worker,
                column_index,
                capacity,
            } => {
                let shadow_dir = ctx.shadow_table_dir(worker);
                let meta = TableMeta::load(&shadow_dir)?;
                build_value_index(&shadow_dir, &meta, column_index, capacity)?;
                Ok(TaskOutput::None)
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unexpected panic in import task".to_string()
    }
}

/// Phase 2: parse rows of one chunk, extract timestamps and append
/// per-partition index entries.
fn run_indexing(
    ctx: &ImportContext,
    breaker: &CircuitBreaker,
    chunk_index: usize,
    lo: u64,
    hi: u64,
    starting_line: u64,
    skip_header: bool,
) -> Result<TaskOutput> {
    let mut reader = ChunkReader::open(&ctx.source_path, lo, hi, ctx.config.buffer_len)?;
    let mut lexer = CsvLexer::new(ctx.delimiter);
    lexer.set_starting_line(starting_line);
    let mut writer = IndexChunkWriter::new(&ctx.import_root, chunk_index);

    let ts_index = ctx.schema.timestamp_index;
    let partition_by = ctx.config.partition_by;
    let atomicity = ctx.config.atomicity;
    let mut errors = 0u64;
    let mut rows = 0u64;
    let mut skip_next = skip_header;
    {
        let mut sink = |rec: &CsvRecord<'_>| -> Result<bool> {
            rows += 1;
            if rows % CANCEL_CHECK_INTERVAL == 0 && breaker.is_tripped() {
                return Err(StrataError::Cancelled);
            }
            if skip_next {
                skip_next = false;
                return Ok(true);
            }
            let bytes = if ts_index < rec.field_count() {
                rec.field(ts_index)
            } else {
                &[]
            };
            match (ctx.timestamp_parser)(bytes) {
                Ok(ts) => {
                    writer.append(&partition_by.dir_name(ts), ts, rec.start_offset as i64)?;
                    Ok(true)
                }
                Err(_) => {
                    if atomicity == Atomicity::SkipAll {
                        return Err(StrataError::BadTimestamp {
                            offset: rec.start_offset,
                            line: rec.line_number,
                        });
                    }
                    errors += 1;
                    log::error!(
                        "could not parse timestamp [line={}, offset={}, value='{}']",
                        rec.line_number,
                        rec.start_offset,
                        String::from_utf8_lossy(bytes)
                    );
                    Ok(true)
                }
            }
        };
        loop {
            let base = reader.offset();
            let data = reader.fill()?;
            if data.is_empty() {
                break;
            }
            lexer.parse(data, base, &mut sink)?;
        }
        lexer.finish(hi, &mut sink)?;
    }
    let partition_keys = writer.finish()?;
    Ok(TaskOutput::Indexed {
        max_line_length: lexer.max_line_length(),
        partition_keys,
        errors,
    })
}

/// Phase 3: merge a partition's index chunks, read rows in timestamp
/// order and append them to this worker's shadow table.
fn run_partition_import(
    ctx: &ImportContext,
    breaker: &CircuitBreaker,
    worker: usize,
    partitions: &[String],
    max_line_length: u64,
) -> Result<TaskOutput> {
    let mut shadow_schema = ctx.schema.clone();
    shadow_schema.table_name = ctx.shadow_table_name(worker);
    for col in &mut shadow_schema.columns {
        col.indexed = false;
    }
    let mut writer = TableWriter::create(&ctx.import_root, shadow_schema, ctx.config.partition_by)?;

    match import_partitions(ctx, breaker, &mut writer, partitions, max_line_length) {
        Ok(output) => {
            writer.commit_sync()?;
            Ok(output)
        }
        Err(e) => {
            // roll the shadow table back before the writer is closed
            writer.rollback()?;
            Err(e)
        }
    }
}

fn import_partitions(
    ctx: &ImportContext,
    breaker: &CircuitBreaker,
    writer: &mut TableWriter,
    partitions: &[String],
    max_line_length: u64,
) -> Result<TaskOutput> {
    let source = File::open(&ctx.source_path).map_err(|e| StrataError::OpenFailed {
        path: ctx.source_path.clone(),
        source: e,
    })?;
    let file_len = source.metadata()?.len();
    let buf_len = (2 * max_line_length as usize).max(ctx.config.buffer_len);
    let mut buf = vec![0u8; buf_len];
    let mut lexer = CsvLexer::new(ctx.delimiter);
    let mut utf8_sink = Utf8Sink::new();

    let ts_index = ctx.schema.timestamp_index;
    let column_count = ctx.schema.column_count();
    let atomicity = ctx.config.atomicity;

    let mut rows_per_partition = Vec::with_capacity(partitions.len());
    let mut total_errors = 0u64;

    for partition in partitions {
        let merged = merge_partition_index(&ctx.import_root.join(partition))?;
        lexer.clear();
        let mut lines = 0u64;
        let mut errors = 0u64;

        for (i, entry) in merged.iter().enumerate() {
            if i as u64 % CANCEL_CHECK_INTERVAL == 0 && breaker.is_tripped() {
                return Err(StrataError::Cancelled);
            }
            let offset = entry.offset as u64;
            let n = source
                .read_at(&mut buf, offset)
                .map_err(|e| StrataError::ReadFailed {
                    path: ctx.source_path.clone(),
                    offset,
                    source: e,
                })?;
            if n == 0 {
                return Err(StrataError::ReadFailed {
                    path: ctx.source_path.clone(),
                    offset,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "indexed row offset past end of file",
                    ),
                });
            }

            let row_done = std::cell::Cell::new(false);
            {
                let mut sink = |rec: &CsvRecord<'_>| -> Result<bool> {
                    row_done.set(true);
                    let mut row = writer.new_row(entry.timestamp)?;
                    let field_count = rec.field_count().min(column_count);
                    for f in 0..field_count {
                        if f == ts_index {
                            continue;
                        }
                        let bytes = rec.field(f);
                        if bytes.is_empty() {
                            continue;
                        }
                        let column_type = ctx.schema.columns[f].column_type;
                        if write_field(&mut row, f, column_type, bytes, &mut utf8_sink).is_err() {
                            errors += 1;
                            log::error!(
                                "type syntax [type={}, line offset={}, column={}, value='{}']",
                                column_type.name(),
                                rec.start_offset,
                                f,
                                String::from_utf8_lossy(bytes)
                            );
                            match atomicity {
                                Atomicity::SkipAll => {
                                    return Err(StrataError::BadField {
                                        offset: rec.start_offset,
                                        column: f,
                                    });
                                }
                                Atomicity::SkipRow => {
                                    row.cancel();
                                    return Ok(false);
                                }
                                Atomicity::SkipColumn => {}
                            }
                        }
                    }
                    row.append()?;
                    Ok(false)
                };
                let consumed_all = lexer.parse(&buf[..n], offset, &mut sink)?;
                if consumed_all && !row_done.get() {
                    if offset + (n as u64) < file_len {
                        return Err(StrataError::Corrupt(format!(
                            "row at offset {offset} exceeds read buffer of {buf_len} bytes"
                        )));
                    }
                    // final row of the file has no trailing newline
                    lexer.finish(offset + n as u64, &mut sink)?;
                }
            }
            if !row_done.get() {
                return Err(StrataError::Corrupt(format!(
                    "no row found at indexed offset {offset}"
                )));
            }
            lines += 1;
        }

        let imported = if atomicity == Atomicity::SkipRow {
            lines - errors
        } else {
            lines
        };
        rows_per_partition.push((partition.clone(), imported));
        total_errors += errors;
        log::info!(
            "imported partition data [partition={partition}, lines={lines}, errors={errors}]"
        );
    }

    Ok(TaskOutput::Imported {
        rows_per_partition,
        errors: total_errors,
    })
}

/// Phase 4: union per-worker dictionaries for one symbol column into the
/// final table's dictionary, writing a key remap per worker.
fn run_symbol_table_merge(
    ctx: &ImportContext,
    column_index: usize,
    shadow_workers: &[usize],
) -> Result<TaskOutput> {
    let column = &ctx.schema.columns[column_index].name;
    let mut final_writer = SymbolMapWriter::open(&ctx.final_table_dir, column)?;
    for &worker in shadow_workers {
        let shadow_dir = ctx.shadow_table_dir(worker);
        merge_symbols(&mut final_writer, &shadow_dir, column)?;
    }
    final_writer.save()?;
    Ok(TaskOutput::SymbolsMerged {
        column_index,
        final_count: final_writer.symbol_count() as u64,
    })
}
