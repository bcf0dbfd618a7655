//! Parallel CSV bulk import
//!
//! Materializes a single large delimited file into the native columnar
//! format through a six-phase pipeline: safe chunk boundaries, per-chunk
//! timestamp indexing, per-partition import into per-worker shadow
//! tables, dictionary merge, key remapping and index builds. The
//! coordinator lives in [`pipeline`]; the per-phase work units live in
//! [`task`].

mod pipeline;
mod task;

#[cfg(test)]
mod tests;

pub use pipeline::{import_csv, CsvImportJob, JobResult, JobStatus};
pub use task::{
    CircuitBreaker, ImportContext, ImportPhase, ImportTask, TaskOutput, TaskResult, TaskStatus,
    CANCEL_CHECK_INTERVAL,
};
