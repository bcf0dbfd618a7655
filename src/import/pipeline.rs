//! Import pipeline coordinator
//!
//! Drives the six phases in strict order on a shared worker pool. Within
//! a phase, tasks run in parallel and in any order; a phase starts only
//! when every task of the previous phase reported OK. The first non-OK
//! task outcome becomes the job's terminal status and the remaining
//! phases are skipped.
//!
//! On failure or cancellation the coordinator tears down the shadow
//! tables, removes the import root (unless `keep_artifacts`) and drops the
//! half-created target table.

use crate::config::ImportConfig;
use crate::engine::Engine;
use crate::import::task::{
    CircuitBreaker, ImportContext, ImportPhase, ImportTask, TaskOutput, TaskResult, TaskStatus,
};
use crate::schema::TableSchema;
use crate::table::TableMeta;
use crate::text::QuoteCensus;
use crate::{Result, StrataError};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Terminal outcome of an import job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Ok,
    Failed(String),
    Cancelled,
}

/// What an import job reports back.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: JobStatus,
    pub imported_rows_per_partition: BTreeMap<String, u64>,
    pub errors: u64,
}

impl JobResult {
    fn terminal(status: JobStatus) -> Self {
        Self {
            status,
            imported_rows_per_partition: BTreeMap::new(),
            errors: 0,
        }
    }

    pub fn imported_rows(&self) -> u64 {
        self.imported_rows_per_partition.values().sum()
    }
}

/// One CSV import invocation.
pub struct CsvImportJob {
    pub source_path: PathBuf,
    pub schema: TableSchema,
    pub delimiter: u8,
    pub config: ImportConfig,
    /// Parser for the designated timestamp column
    pub timestamp_parser: fn(&[u8]) -> Result<i64>,
    pub circuit_breaker: Arc<CircuitBreaker>,
}

impl CsvImportJob {
    pub fn new(source_path: impl Into<PathBuf>, schema: TableSchema) -> Self {
        Self {
            source_path: source_path.into(),
            schema,
            delimiter: b',',
            config: ImportConfig::default(),
            timestamp_parser: crate::text::parse_timestamp,
            circuit_breaker: Arc::new(CircuitBreaker::new()),
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Override the timestamp parser, e.g. for epoch-seconds sources.
    pub fn timestamp_parser(mut self, parser: fn(&[u8]) -> Result<i64>) -> Self {
        self.timestamp_parser = parser;
        self
    }

    pub fn config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = breaker;
        self
    }
}

/// A resolved parse range for one indexing task: `[lo, hi)` starts at a
/// safe line break and `hi` is the next chunk's safe start.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkSpan {
    chunk_index: usize,
    lo: u64,
    hi: u64,
    starting_line: u64,
}

/// Run an import job to completion. `Err` is reserved for invalid input
/// detected before the pipeline starts; every pipeline outcome, including
/// failure and cancellation, is a `JobResult`.
pub fn import_csv(engine: &Engine, job: &CsvImportJob) -> Result<JobResult> {
    job.config.validate()?;
    job.schema.validate()?;

    // cancellation before any phase writes no output at all
    if job.circuit_breaker.is_tripped() {
        return Ok(JobResult::terminal(JobStatus::Cancelled));
    }

    let source_len = fs::metadata(&job.source_path)
        .map_err(|e| StrataError::OpenFailed {
            path: job.source_path.clone(),
            source: e,
        })?
        .len();

    engine.create_table(job.schema.clone(), job.config.partition_by)?;
    let table_name = job.schema.table_name.clone();

    if source_len == 0 {
        log::info!("import of empty file complete [table={table_name}]");
        return Ok(JobResult {
            status: JobStatus::Ok,
            imported_rows_per_partition: BTreeMap::new(),
            errors: 0,
        });
    }

    let import_root = engine.db_root().join(format!(".import_{table_name}"));
    if import_root.exists() {
        fs::remove_dir_all(&import_root)?;
    }
    fs::create_dir_all(&import_root)?;

    let ctx = Arc::new(ImportContext {
        source_path: job.source_path.clone(),
        import_root: import_root.clone(),
        final_table_dir: engine.table_dir(&table_name)?,
        schema: job.schema.clone(),
        config: job.config.clone(),
        delimiter: job.delimiter,
        timestamp_parser: job.timestamp_parser,
    });

    let coordinator = Coordinator {
        engine,
        job,
        ctx,
        source_len,
    };
    let result = match coordinator.run_pipeline() {
        Ok((rows, errors)) => {
            cleanup_import_root(&import_root, job.config.keep_artifacts);
            log::info!(
                "import complete [table={table_name}, rows={}, errors={errors}]",
                rows.values().sum::<u64>()
            );
            JobResult {
                status: JobStatus::Ok,
                imported_rows_per_partition: rows,
                errors,
            }
        }
        Err(status) => {
            log::error!("import terminated [table={table_name}, status={status:?}]");
            cleanup_import_root(&import_root, job.config.keep_artifacts);
            // the half-created target table is dropped with the artifacts
            if !job.config.keep_artifacts {
                let _ = engine.drop_table(&table_name);
            }
            JobResult::terminal(status)
        }
    };
    Ok(result)
}

fn cleanup_import_root(import_root: &PathBuf, keep_artifacts: bool) {
    if keep_artifacts {
        return;
    }
    if let Err(e) = fs::remove_dir_all(import_root) {
        log::error!(
            "could not remove import root [path={}, error={e}]",
            import_root.display()
        );
    }
}

struct Coordinator<'a> {
    engine: &'a Engine,
    job: &'a CsvImportJob,
    ctx: Arc<ImportContext>,
    source_len: u64,
}

type PhaseResult<T> = std::result::Result<T, JobStatus>;

impl Coordinator<'_> {
    fn run_pipeline(&self) -> PhaseResult<(BTreeMap<String, u64>, u64)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.job.config.worker_count)
            .build()
            .map_err(|e| JobStatus::Failed(format!("cannot build worker pool: {e}")))?;

        // phase 1: locate safe line breaks inside quote-aware chunks
        let chunks = self.plan_chunks();
        let tasks = chunks
            .iter()
            .map(|&(lo, hi)| ImportTask::BoundaryCheck {
                ctx: Arc::clone(&self.ctx),
                lo,
                hi,
            })
            .collect();
        let outputs = self.run_phase(&pool, ImportPhase::BoundaryCheck, tasks)?;
        let censuses: Vec<QuoteCensus> = outputs
            .into_iter()
            .map(|o| match o {
                TaskOutput::Census(c) => c,
                _ => QuoteCensus::empty(),
            })
            .collect();

        // phase 2: per-chunk row indexing
        let spans = stitch_chunks(&censuses, self.source_len);
        let tasks = spans
            .iter()
            .map(|span| ImportTask::Indexing {
                ctx: Arc::clone(&self.ctx),
                chunk_index: span.chunk_index,
                lo: span.lo,
                hi: span.hi,
                starting_line: span.starting_line,
                skip_header: self.job.config.ignore_header && span.lo == 0,
            })
            .collect();
        let outputs = self.run_phase(&pool, ImportPhase::Indexing, tasks)?;
        let mut max_line_length = 0u64;
        let mut partition_set = BTreeSet::new();
        let mut total_errors = 0u64;
        for output in outputs {
            if let TaskOutput::Indexed {
                max_line_length: m,
                partition_keys,
                errors,
            } = output
            {
                max_line_length = max_line_length.max(m);
                partition_set.extend(partition_keys);
                total_errors += errors;
            }
        }
        let partitions: Vec<String> = partition_set.into_iter().collect();
        if partitions.is_empty() {
            return Ok((BTreeMap::new(), total_errors));
        }

        // phase 3: per-partition import into per-worker shadow tables
        let worker_count = self.job.config.worker_count;
        let task_count = worker_count.min(partitions.len());
        let per_task = partitions.len().div_ceil(task_count);
        let slices: Vec<Vec<String>> = partitions
            .chunks(per_task)
            .map(|s| s.to_vec())
            .collect();
        let shadow_workers: Vec<usize> = (0..slices.len()).collect();
        let tasks = slices
            .iter()
            .enumerate()
            .map(|(worker, slice)| ImportTask::PartitionImport {
                ctx: Arc::clone(&self.ctx),
                worker,
                partitions: slice.clone(),
                max_line_length,
            })
            .collect();
        let outputs = self.run_phase(&pool, ImportPhase::PartitionImport, tasks)?;
        let mut imported_rows = BTreeMap::new();
        for output in outputs {
            if let TaskOutput::Imported {
                rows_per_partition,
                errors,
            } = output
            {
                for (partition, rows) in rows_per_partition {
                    *imported_rows.entry(partition).or_insert(0) += rows;
                }
                total_errors += errors;
            }
        }

        // phase 4: merge per-worker symbol dictionaries, one task per column
        let symbol_columns = self.job.schema.symbol_columns();
        let tasks = symbol_columns
            .iter()
            .map(|&column_index| ImportTask::SymbolTableMerge {
                ctx: Arc::clone(&self.ctx),
                column_index,
                shadow_workers: shadow_workers.clone(),
            })
            .collect();
        let outputs = self.run_phase(&pool, ImportPhase::SymbolTableMerge, tasks)?;
        let mut symbol_counts = Vec::new();
        for output in outputs {
            if let TaskOutput::SymbolsMerged {
                column_index,
                final_count,
            } = output
            {
                symbol_counts.push((column_index, final_count));
            }
        }

        // phase 5: rewrite symbol keys through the per-worker remaps
        let shadow_metas = self
            .load_shadow_metas(&shadow_workers)
            .map_err(|e| JobStatus::Failed(e.to_string()))?;
        let mut tasks = Vec::new();
        for (&worker, meta) in shadow_workers.iter().zip(&shadow_metas) {
            for partition in &meta.partitions {
                for &column_index in &symbol_columns {
                    tasks.push(ImportTask::UpdateSymbolKeys {
                        ctx: Arc::clone(&self.ctx),
                        worker,
                        partition: partition.name.clone(),
                        column_index,
                        row_count: partition.row_count,
                        symbol_count: meta.symbol_counts[column_index],
                    });
                }
            }
        }
        self.run_phase(&pool, ImportPhase::UpdateSymbolKeys, tasks)?;

        // phase 6: build value-list indices, one task per (worker, column)
        let indexed_columns = self.job.schema.indexed_columns();
        let mut tasks = Vec::new();
        for &worker in &shadow_workers {
            for &column_index in &indexed_columns {
                tasks.push(ImportTask::BuildIndex {
                    ctx: Arc::clone(&self.ctx),
                    worker,
                    column_index,
                    capacity: self.job.schema.columns[column_index].index_value_block_capacity,
                });
            }
        }
        self.run_phase(&pool, ImportPhase::BuildIndex, tasks)?;
        self.record_indexes(&shadow_workers, &indexed_columns)
            .map_err(|e| JobStatus::Failed(e.to_string()))?;

        // cut the shadow partitions over into the target table
        self.engine.release_all_readers();
        self.attach_shadows(&shadow_workers, &symbol_counts)
            .map_err(|e| JobStatus::Failed(e.to_string()))?;

        Ok((imported_rows, total_errors))
    }

    /// Split `[0, source_len)` into one tentative chunk per worker.
    fn plan_chunks(&self) -> Vec<(u64, u64)> {
        let n = self.job.config.worker_count as u64;
        let chunk_size = self.source_len.div_ceil(n);
        let mut chunks = Vec::new();
        let mut lo = 0u64;
        while lo < self.source_len {
            let hi = (lo + chunk_size).min(self.source_len);
            chunks.push((lo, hi));
            lo = hi;
        }
        chunks
    }

    fn run_phase(
        &self,
        pool: &rayon::ThreadPool,
        phase: ImportPhase,
        tasks: Vec<ImportTask>,
    ) -> PhaseResult<Vec<TaskOutput>> {
        if self.job.circuit_breaker.is_tripped() {
            return Err(JobStatus::Cancelled);
        }
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        log::debug!("phase {} [tasks={}]", phase.name(), tasks.len());
        let breaker = &self.job.circuit_breaker;
        let results: Vec<TaskResult> = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| task.run(breaker))
                .collect()
        });
        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            match result.status {
                TaskStatus::Ok => outputs.push(result.output),
                TaskStatus::Cancelled => return Err(JobStatus::Cancelled),
                TaskStatus::Error(message) => return Err(JobStatus::Failed(message)),
            }
        }
        Ok(outputs)
    }

    fn load_shadow_metas(&self, shadow_workers: &[usize]) -> Result<Vec<TableMeta>> {
        shadow_workers
            .iter()
            .map(|&worker| TableMeta::load(&self.ctx.shadow_table_dir(worker)))
            .collect()
    }

    /// Flip the index flags in each shadow table's metadata once its index
    /// files exist.
    fn record_indexes(&self, shadow_workers: &[usize], indexed_columns: &[usize]) -> Result<()> {
        if indexed_columns.is_empty() {
            return Ok(());
        }
        for &worker in shadow_workers {
            let dir = self.ctx.shadow_table_dir(worker);
            let mut meta = TableMeta::load(&dir)?;
            for &column_index in indexed_columns {
                meta.add_index(
                    column_index,
                    self.job.schema.columns[column_index].index_value_block_capacity,
                );
            }
            meta.save(&dir)?;
        }
        Ok(())
    }

    fn attach_shadows(
        &self,
        shadow_workers: &[usize],
        symbol_counts: &[(usize, u64)],
    ) -> Result<()> {
        let table_name = &self.job.schema.table_name;
        for &worker in shadow_workers {
            self.engine
                .attach_partitions(table_name, &self.ctx.shadow_table_dir(worker))?;
        }
        if !symbol_counts.is_empty() {
            self.engine.update_symbol_counts(table_name, symbol_counts)?;
        }
        Ok(())
    }
}

/// Resolve each chunk's first safe line break from the quote censuses.
///
/// `P(0) = 0`, `P(k+1) = P(k) XOR (quote_count(k) & 1)`; the safe start of
/// chunk `k` is its first newline of parity `P(k)`. A chunk without such a
/// newline is absorbed by its left neighbour.
fn stitch_chunks(censuses: &[QuoteCensus], source_len: u64) -> Vec<ChunkSpan> {
    let mut resolved: Vec<(usize, u64, u64)> = Vec::new();
    let mut parity = 0u64;
    let mut rows_before = 0u64;
    for (k, census) in censuses.iter().enumerate() {
        let p = parity as usize;
        if k == 0 {
            resolved.push((0, 0, 0));
        } else if census.first_newline[p] != -1 {
            resolved.push((k, census.first_newline[p] as u64, rows_before + 1));
        }
        rows_before += census.newline_count[p];
        parity ^= census.quote_count & 1;
    }

    let mut spans = Vec::new();
    for (i, &(chunk_index, lo, starting_line)) in resolved.iter().enumerate() {
        let hi = if i + 1 < resolved.len() {
            resolved[i + 1].1
        } else {
            source_len
        };
        if hi > lo {
            spans.push(ChunkSpan {
                chunk_index,
                lo,
                hi,
                starting_line,
            });
        }
    }
    spans
}

#[cfg(test)]
mod stitch_tests {
    use super::*;

    fn census(quotes: u64, nl_even: (u64, i64), nl_odd: (u64, i64)) -> QuoteCensus {
        QuoteCensus {
            quote_count: quotes,
            newline_count: [nl_even.0, nl_odd.0],
            first_newline: [nl_even.1, nl_odd.1],
        }
    }

    #[test]
    fn test_stitch_single_chunk() {
        let spans = stitch_chunks(&[census(0, (3, 4), (0, -1))], 12);
        assert_eq!(
            spans,
            vec![ChunkSpan {
                chunk_index: 0,
                lo: 0,
                hi: 12,
                starting_line: 0
            }]
        );
    }

    #[test]
    fn test_stitch_two_plain_chunks() {
        // 20 bytes, rows of 5; chunk 1 starts mid-row
        let spans = stitch_chunks(
            &[census(0, (2, 5), (0, -1)), census(0, (2, 15), (0, -1))],
            20,
        );
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].lo, 0);
        assert_eq!(spans[0].hi, 15);
        assert_eq!(spans[1].lo, 15);
        assert_eq!(spans[1].hi, 20);
        // two newlines in chunk 0, plus the one that resolves chunk 1's start
        assert_eq!(spans[1].starting_line, 3);
    }

    #[test]
    fn test_stitch_quoted_boundary_prefers_even_parity() {
        // chunk 0 ends inside a quote, so chunk 1 scans with inverted
        // parity: its local-even newline at 40 is the quoted one and its
        // local-odd newline at 25 is the true line break
        let spans = stitch_chunks(
            &[census(1, (1, 8), (0, -1)), census(1, (1, 40), (1, 25))],
            64,
        );
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].lo, 25);
    }

    #[test]
    fn test_stitch_chunk_without_safe_newline_is_absorbed() {
        let spans = stitch_chunks(
            &[
                census(0, (1, 6), (0, -1)),
                census(0, (0, -1), (0, -1)),
                census(0, (1, 30), (0, -1)),
            ],
            40,
        );
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].lo, 0);
        assert_eq!(spans[0].hi, 30);
        assert_eq!(spans[1].lo, 30);
        assert_eq!(spans[1].hi, 40);
        assert_eq!(spans[1].starting_line, 2);
    }

    #[test]
    fn test_stitch_no_newline_at_all_is_one_row() {
        let spans = stitch_chunks(
            &[census(0, (0, -1), (0, -1)), census(0, (0, -1), (0, -1))],
            17,
        );
        assert_eq!(
            spans,
            vec![ChunkSpan {
                chunk_index: 0,
                lo: 0,
                hi: 17,
                starting_line: 0
            }]
        );
    }

    #[test]
    fn test_stitch_skips_empty_span() {
        // chunk 1's resolved start is exactly the end of the file
        let spans = stitch_chunks(
            &[census(0, (1, 5), (0, -1)), census(0, (1, 10), (0, -1))],
            10,
        );
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].hi, 10);
    }
}
