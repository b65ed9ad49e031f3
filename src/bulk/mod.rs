//! Bulk import pipeline: table controller, row-buffer ring, column buffer
//! managers, value conversion, dictionary tokenization, reject reporting,
//! and bulk rollback.

pub mod column_buffer;
pub mod column_info;
pub mod convert;
pub mod dictionary;
pub mod parquet;
pub mod reject;
pub mod rollback;
pub mod row_buffer;
pub mod table;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle status of a table import, a row buffer, or a (buffer, column)
/// cell.  Advances monotonically; `Err` is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    New,
    ReadInProgress,
    ReadComplete,
    ParseInProgress,
    ParseComplete,
    Err,
}

/// Source format of the import data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Delimited text with optional enclosure and escape characters.
    Text,
    /// Fixed-length binary records.
    BinaryFixed,
    /// Parquet files read a RecordBatch at a time.
    Parquet,
}

/// Where lock and rollback responsibilities live for this import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Mode 3: this process owns the table lock and bulk rollback.
    Local,
    /// Mode 1: distributed import; the coordinator owns locks/rollback and
    /// BRM updates are written to a report file.
    RemoteSingleSrc,
    /// Mode 2: central command; the coordinator owns locks/rollback.
    RemoteMultipleSrc,
}

impl BulkMode {
    /// Lock, rollback-meta, and temp-file cleanup are coordinator-owned in
    /// the remote modes.
    pub fn coordinator_owned(&self) -> bool {
        matches!(self, BulkMode::RemoteSingleSrc | BulkMode::RemoteMultipleSrc)
    }
}

/// Cooperative job-wide termination flag shared by every thread of a job.
///
/// Any thread that hits a fatal error raises the flag; readers and parsers
/// poll it at their suspension points and unwind.
#[derive(Debug, Default)]
pub struct JobStatus {
    failed: AtomicBool,
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}
