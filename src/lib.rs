//! StrataBase Bulk-Ingest Engine
//!
//! The per-table import pipeline for the StrataBase columnar storage format:
//! a reader thread fills a small ring of shared row buffers, parser workers
//! drain them column by column, and each column's append-only buffer manager
//! scatters converted values into extent-partitioned segment files while
//! keeping crash-safe rollback metadata on disk.

pub mod brm;
pub mod bulk;
pub mod config;
pub mod data;

// Re-export main types
pub use brm::{BrmClient, ExtentAlloc, LocalBrm, TableLockState};
pub use bulk::table::TableController;
pub use bulk::{BulkMode, ImportMode, JobStatus, TableStatus};
pub use config::Config;
pub use data::{JobColumn, LogicalKind, StorageKind};

/// Bulk-ingest error type
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error opening file: {0}")]
    FileOpen(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(
        "Actual error row count ({err_rows}) exceeds the max error rows ({max_rows}) \
         allowed for table {table}"
    )]
    MaxErrorRows {
        table: String,
        err_rows: u64,
        max_rows: u64,
    },

    #[error("{stage} HWMs do not match for column {col1} and column {col2}")]
    HwmsNotEqual {
        stage: String,
        col1: String,
        col2: String,
    },

    #[error("{stage} HWMs are not in sync for column {col1} and column {col2}")]
    HwmsOutOfSync {
        stage: String,
        col1: String,
        col2: String,
    },

    #[error("{stage} unsupported width for column {col}; width {width}")]
    UnsupportedWidth {
        stage: String,
        col: String,
        width: usize,
    },

    #[error("Unable to acquire lock for table {table}; currently locked by {owner}")]
    TableLockTimeout { table: String, owner: String },

    #[error(
        "Bulk rollback not performed for table {table}; DBRoot{dbroot} moved from this \
         node during bulk load. Run cleartablelock to rollback and release the table lock \
         across nodes."
    )]
    RollbackMissingRoot { table: String, dbroot: u16 },

    #[error("BRM error: {0}")]
    Brm(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("Job terminated by another thread: {0}")]
    JobTerminated(String),

    #[error("Table is in error state")]
    TableInErrorState,
}

pub type Result<T> = std::result::Result<T, BulkError>;
