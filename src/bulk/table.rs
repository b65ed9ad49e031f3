//! Per-table import controller.
//!
//! Owns the ring of row buffers and every column's runtime state; runs the
//! single reader thread and coordinates the parser workers through the
//! ring.  Also owns the table lifecycle: table lock acquisition, rollback
//! metadata, HWM validation, end-of-job BRM publication, and rollback on
//! abnormal termination.
//!
//! Locking: the table mutex guards the ring and lifecycle state and is held
//! only for state transitions; parsing and file I/O always run outside it.
//! The reject sink and its error-row counter live behind their own mutex.
//! When both are taken, the table mutex is taken first.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::brm::{BrmClient, ExtentStripeAllocator, Lbid, LockOwner, TableLockState};
use crate::bulk::column_info::{BrmUpdate, ColumnInfo};
use crate::bulk::parquet::{self, ParquetSource};
use crate::bulk::reject::RejectSink;
use crate::bulk::rollback::{
    snapshot_column_files, BulkRollbackManager, ColumnSnapshot, RollbackMeta, RollbackMetaWriter,
};
use crate::bulk::row_buffer::{RowBuffer, TextSettings};
use crate::bulk::telemetry::{ImportTeleStats, LogTeleClient, TeleClient, TeleEventKind};
use crate::bulk::{BulkMode, ImportMode, JobStatus, TableStatus};
use crate::config::Config;
use crate::data::{DbRootExtentInfo, JobColumn, LogicalKind};
use crate::{BulkError, Result};

/// Milliseconds between table-lock retries.
const LOCK_RETRY_MS: u64 = 100;

/// Object-storage location of one input blob.
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    pub bucket: String,
    pub host: String,
    pub region: String,
    pub key: String,
    pub secret: String,
    pub file: String,
}

/// Fetches one object wholesale into memory.
pub trait ObjectFetcher: Send + Sync {
    fn fetch(&self, spec: &ObjectSpec) -> Result<Vec<u8>>;
}

/// Static parameters of one table import job.
#[derive(Debug, Clone)]
pub struct TableSettings {
    pub table_id: i32,
    pub table_name: String,
    pub table_oid: u32,
    pub txn_id: i32,
    pub job_id: u32,
    pub process_name: String,
    /// Directory holding the column segment and dictionary store files.
    pub base_dir: PathBuf,
    /// Directory holding bulk-rollback metadata files.
    pub meta_dir: PathBuf,
    pub import_mode: ImportMode,
    pub bulk_mode: BulkMode,
    pub max_error_rows: u64,
    pub keep_rb_meta: bool,
    pub text: TextSettings,
    /// Record length for fixed binary imports; 0 derives it from widths.
    pub fixed_binary_rec_len: usize,
    /// BRM report file for distributed (mode 1) imports.
    pub brm_report_path: Option<PathBuf>,
    pub system_name: String,
    pub module_name: String,
}

impl TableSettings {
    pub fn new(table_name: &str, table_oid: u32, base_dir: &Path) -> Self {
        Self {
            table_id: 0,
            table_name: table_name.to_string(),
            table_oid,
            txn_id: -1,
            job_id: 0,
            process_name: "bulkload".to_string(),
            base_dir: base_dir.to_path_buf(),
            meta_dir: base_dir.join("bulkRollbackMeta"),
            import_mode: ImportMode::Text,
            bulk_mode: BulkMode::Local,
            max_error_rows: 5,
            keep_rb_meta: false,
            text: TextSettings::default(),
            fixed_binary_rec_len: 0,
            brm_report_path: None,
            system_name: "stratabase".to_string(),
            module_name: "pm1".to_string(),
        }
    }
}

struct Cell {
    locker: Option<usize>,
    status: TableStatus,
}

struct BufState {
    status: TableStatus,
    cells: Vec<Cell>,
}

struct TableState {
    status: TableStatus,
    locker: Option<usize>,
    current_read_buffer: usize,
    current_parse_buffer: usize,
    last_buffer_id: Option<usize>,
    cols_parsed: usize,
    buffers: Vec<BufState>,
    /// Per-column elapsed time of the last parse, for worker scheduling.
    last_parse_ms: Vec<f64>,
}

struct RejectState {
    sink: RejectSink,
    total_err_rows: u64,
}

/// Coordinates one table's read, parse, and finalize phases.
pub struct TableController {
    settings: TableSettings,

    block_size: usize,
    read_buffer_size: usize,
    parquet_batch_size: usize,
    wait_period_secs: u64,
    module_id: u32,
    dict_blocks_per_extent: u64,

    brm: Arc<dyn BrmClient>,
    tele: Arc<dyn TeleClient>,
    job_status: Arc<JobStatus>,
    job_uuid: Uuid,

    alloc: Arc<ExtentStripeAllocator>,
    columns: Vec<Arc<ColumnInfo>>,
    buffers: Vec<RowBuffer>,

    state: Mutex<TableState>,
    buffer_ready: Condvar,
    reject: Mutex<RejectState>,
    rb_meta: Mutex<RollbackMetaWriter>,

    load_files: Vec<PathBuf>,
    read_from_stdin: bool,
    object_source: Option<(ObjectSpec, Arc<dyn ObjectFetcher>)>,

    processing_begun: AtomicBool,
    table_locked: AtomicBool,
    table_lock_id: AtomicU64,
    orig_dbroots: Mutex<Vec<u16>>,
    dict_flush_blocks: Mutex<Vec<Lbid>>,
    total_read_rows: AtomicU64,
    start_time: Mutex<Option<Instant>>,
}

impl TableController {
    pub fn new(
        settings: TableSettings,
        config: &Config,
        brm: Arc<dyn BrmClient>,
        job_status: Arc<JobStatus>,
    ) -> Self {
        let alloc = Arc::new(ExtentStripeAllocator::new(
            settings.table_oid,
            Arc::clone(&brm),
            config.extent_rows(),
            config.block_size(),
        ));

        let reject = RejectState {
            sink: RejectSink::new(settings.job_id, config.error_dir()),
            total_err_rows: 0,
        };

        let rb_meta = RollbackMetaWriter::new(&settings.process_name);

        Self {
            block_size: config.block_size(),
            read_buffer_size: config.read_buffer_size(),
            parquet_batch_size: config.parquet_batch_size(),
            wait_period_secs: config.wait_period(),
            module_id: config.local_module_id(),
            dict_blocks_per_extent: 64,
            settings,
            brm,
            tele: Arc::new(LogTeleClient),
            job_status,
            job_uuid: Uuid::new_v4(),
            alloc,
            columns: Vec::new(),
            buffers: Vec::new(),
            state: Mutex::new(TableState {
                status: TableStatus::New,
                locker: None,
                current_read_buffer: 0,
                current_parse_buffer: 0,
                last_buffer_id: None,
                cols_parsed: 0,
                buffers: Vec::new(),
                last_parse_ms: Vec::new(),
            }),
            buffer_ready: Condvar::new(),
            reject: Mutex::new(reject),
            rb_meta: Mutex::new(rb_meta),
            load_files: Vec::new(),
            read_from_stdin: false,
            object_source: None,
            processing_begun: AtomicBool::new(false),
            table_locked: AtomicBool::new(false),
            table_lock_id: AtomicU64::new(0),
            orig_dbroots: Mutex::new(Vec::new()),
            dict_flush_blocks: Mutex::new(Vec::new()),
            total_read_rows: AtomicU64::new(0),
            start_time: Mutex::new(None),
        }
    }

    // ========== Setup (single-threaded, before the job starts) ==========

    /// Append a column; the aux column, if present, must come last.
    pub fn add_column(&mut self, column: JobColumn) -> Result<()> {
        std::fs::create_dir_all(&self.settings.base_dir)?;
        self.alloc.add_column(column.oid, column.width);

        let info = ColumnInfo::new(
            column,
            &self.settings.base_dir,
            Arc::clone(&self.brm),
            Arc::clone(&self.alloc),
            Arc::clone(&self.job_status),
            self.block_size,
            self.dict_blocks_per_extent,
        )?;

        self.columns.push(Arc::new(info));
        Ok(())
    }

    /// Preallocate the ring of row buffers.
    pub fn initialize_buffers(&mut self, count: usize) -> Result<()> {
        let count = count.max(2);
        let ncols = self.columns.len();

        self.buffers = (0..count).map(RowBuffer::new).collect();

        let mut state = self.state.lock();
        state.buffers = (0..count)
            .map(|_| BufState {
                status: TableStatus::New,
                cells: (0..ncols)
                    .map(|_| Cell {
                        locker: None,
                        status: TableStatus::New,
                    })
                    .collect(),
            })
            .collect();
        state.last_parse_ms = vec![0.0; ncols];

        Ok(())
    }

    pub fn set_load_files(&mut self, files: Vec<PathBuf>) {
        self.load_files = files;
    }

    pub fn set_read_from_stdin(&mut self) {
        self.read_from_stdin = true;
    }

    pub fn set_object_source(&mut self, spec: ObjectSpec, fetcher: Arc<dyn ObjectFetcher>) {
        self.object_source = Some((spec, fetcher));
    }

    pub fn set_tele_client(&mut self, tele: Arc<dyn TeleClient>) {
        self.tele = tele;
    }

    // ========== Introspection ==========

    pub fn name(&self) -> &str {
        &self.settings.table_name
    }

    pub fn status(&self) -> TableStatus {
        self.state.lock().status
    }

    pub fn current_parse_buffer(&self) -> usize {
        self.state.lock().current_parse_buffer
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Arc<ColumnInfo>] {
        &self.columns
    }

    pub fn total_read_rows(&self) -> u64 {
        self.total_read_rows.load(Ordering::Relaxed)
    }

    pub fn total_err_rows(&self) -> u64 {
        self.reject.lock().total_err_rows
    }

    pub fn has_processing_begun(&self) -> bool {
        self.processing_begun.load(Ordering::Relaxed)
    }

    // ========== Reader side ==========

    /// Assign the reader role to `locker`.  Succeeds exactly once.
    pub fn lock_for_read(&self, locker: usize) -> bool {
        let mut state = self.state.lock();
        if state.locker.is_none() && state.status == TableStatus::New {
            state.locker = Some(locker);
            return true;
        }
        false
    }

    /// The reader loop: fill ring buffers from the input source list until
    /// every file is consumed or the job fails.
    pub fn read_table_data(&self) -> Result<()> {
        if self.settings.import_mode == ImportMode::Parquet {
            return self.read_parquet_data();
        }

        let read_start = Instant::now();
        *self.start_time.lock() = Some(read_start);
        self.processing_begun.store(true, Ordering::Release);

        log::info!("Start reading and loading table {}", self.settings.table_name);

        let mut tele = ImportTeleStats::start(
            self.job_uuid,
            &self.settings.table_name,
            &self.settings.system_name,
            &self.settings.module_name,
        );
        self.tele.post_import(&tele);

        let sources = self.source_list();
        let mut source_idx = 0usize;
        let (mut reader, mut source_name) = self.open_source(&sources, source_idx)?;
        self.reject.lock().sink.set_input_file(&source_name);

        let mut rows_per_file = 0u64;
        let mut valid_rows = 0u64;
        let mut progress_marker = 0u64;
        let rec_len = self.binary_rec_len();

        loop {
            if self.job_status.is_failed() {
                self.mark_error();
                self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
                return Err(BulkError::JobTerminated(format!(
                    "reader for table {} responding to job termination",
                    self.settings.table_name
                )));
            }

            let read_buf = match self.claim_read_buffer() {
                Some(id) => id,
                None => continue, // waited; re-check job status
            };

            let allowed_errs = {
                let reject = self.reject.lock();
                self.settings.max_error_rows.saturating_sub(reject.total_err_rows)
            };

            let fill = match self.settings.import_mode {
                ImportMode::Text => self.buffers[read_buf].fill_from_text(
                    reader.as_mut(),
                    &self.columns,
                    &self.settings.text,
                    valid_rows,
                    rows_per_file,
                    self.read_buffer_size,
                    allowed_errs,
                ),
                ImportMode::BinaryFixed => self.buffers[read_buf].fill_from_binary(
                    reader.as_mut(),
                    &self.columns,
                    rec_len,
                    valid_rows,
                    rows_per_file,
                    self.read_buffer_size,
                    allowed_errs,
                ),
                ImportMode::Parquet => unreachable!("parquet handled above"),
            };

            let fill = match fill {
                Ok(f) => f,
                Err(e) => {
                    self.mark_error_with_buffer(read_buf);
                    log::error!(
                        "Error reading import file {}; near line {}; {}",
                        source_name.display(),
                        rows_per_file + 1,
                        e
                    );
                    self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
                    return Err(e);
                }
            };

            rows_per_file += fill.rows_read;
            valid_rows += self.buffers[read_buf].row_count() as u64;

            tele.rows_so_far = vec![rows_per_file];
            if rows_per_file / 1_000_000 > progress_marker {
                progress_marker = rows_per_file / 1_000_000;
                self.tele
                    .post_import(&tele.event(TeleEventKind::Progress, rows_per_file));
            }

            // Copy this buffer's rejects into the job-wide reject files.
            let over_budget = {
                let mut reject = self.reject.lock();
                reject.total_err_rows += fill.rejects.len() as u64;
                reject.sink.write_rejects(&fill.rejects)?;
                reject.total_err_rows > self.settings.max_error_rows
            };

            if over_budget {
                let (err_rows, err_files, bad_files) = {
                    let mut reject = self.reject.lock();
                    reject.sink.close()?;
                    (
                        reject.total_err_rows,
                        reject.sink.err_files.clone(),
                        reject.sink.bad_files.clone(),
                    )
                };
                self.mark_error_with_buffer(read_buf);
                log::error!(
                    "Actual error row count ({}) exceeds the max error rows ({}) allowed for table {}",
                    err_rows,
                    self.settings.max_error_rows,
                    self.settings.table_name
                );
                self.report_reject_files(&err_files, &bad_files);
                self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
                return Err(BulkError::MaxErrorRows {
                    table: self.settings.table_name.clone(),
                    err_rows,
                    max_rows: self.settings.max_error_rows,
                });
            }

            // Totals and reject files must be settled before the final
            // buffer is published: finalize may run as soon as workers see
            // it, and it reads both.
            if fill.eof {
                self.reject.lock().sink.close()?;
                self.total_read_rows.fetch_add(rows_per_file, Ordering::Relaxed);
            }

            // Publish the buffer.  The end-of-input transition must happen
            // in the same critical section: a worker finishing the final
            // cell has to observe last_buffer_id, or finalize never runs.
            let is_last_source = source_idx + 1 >= sources.len();
            {
                let mut state = self.state.lock();
                state.buffers[read_buf].status = TableStatus::ReadComplete;
                state.current_read_buffer =
                    (state.current_read_buffer + 1) % self.buffers.len();
                if fill.eof && is_last_source {
                    state.status = TableStatus::ReadComplete;
                    state.last_buffer_id = Some(read_buf);
                }
                self.buffer_ready.notify_all();
            }

            if fill.eof {
                log::info!(
                    "Finished reading {}; {} rows, elapsed {} seconds",
                    source_name.display(),
                    rows_per_file,
                    read_start.elapsed().as_secs()
                );

                if is_last_source {
                    break;
                }
                source_idx += 1;
                let (next_reader, next_name) = self.open_source(&sources, source_idx)?;
                reader = next_reader;
                source_name = next_name;
                self.reject.lock().sink.set_input_file(&source_name);
                rows_per_file = 0;
            }
        }

        self.tele.post_import(&tele.event(
            TeleEventKind::Summary,
            self.total_read_rows.load(Ordering::Relaxed),
        ));

        Ok(())
    }

    fn source_list(&self) -> Vec<PathBuf> {
        if self.read_from_stdin {
            vec![PathBuf::from("stdin")]
        } else if let Some((spec, _)) = &self.object_source {
            vec![PathBuf::from(&spec.file)]
        } else {
            self.load_files.clone()
        }
    }

    fn open_source(&self, sources: &[PathBuf], idx: usize) -> Result<(Box<dyn BufRead>, PathBuf)> {
        let name = sources
            .get(idx)
            .cloned()
            .ok_or_else(|| BulkError::FileOpen("no input source configured".to_string()))?;

        if self.read_from_stdin {
            log::info!(
                "Reading input from STDIN to import into table {}...",
                self.settings.table_name
            );
            return Ok((Box::new(BufReader::new(std::io::stdin())), name));
        }

        if let Some((spec, fetcher)) = &self.object_source {
            let bytes = fetcher.fetch(spec)?;
            return Ok((Box::new(Cursor::new(bytes)), name));
        }

        let file = File::open(&name)
            .map_err(|e| BulkError::FileOpen(format!("{}: {}", name.display(), e)))?;
        log::info!(
            "Opening {} to import into table {}",
            name.display(),
            self.settings.table_name
        );
        Ok((Box::new(BufReader::new(file)), name))
    }

    fn binary_rec_len(&self) -> usize {
        if self.settings.fixed_binary_rec_len > 0 {
            self.settings.fixed_binary_rec_len
        } else {
            self.columns
                .iter()
                .filter(|c| !c.column.is_aux)
                .map(|c| c.column.width)
                .sum()
        }
    }

    /// Claim the current read buffer once it is free, resetting its column
    /// locks.  Returns `None` after a bounded wait so the caller can
    /// re-check the job status.
    fn claim_read_buffer(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let id = state.current_read_buffer;

        match state.buffers[id].status {
            TableStatus::New | TableStatus::ParseComplete => {
                state.buffers[id].status = TableStatus::ReadInProgress;
                for cell in state.buffers[id].cells.iter_mut() {
                    cell.locker = None;
                    cell.status = TableStatus::New;
                }
                Some(id)
            }
            _ => {
                self.buffer_ready
                    .wait_for(&mut state, Duration::from_millis(1));
                None
            }
        }
    }

    // A table-fatal error fails the job: workers blocked on in-order
    // section reservations unwind off the job flag.
    fn mark_error(&self) {
        self.state.lock().status = TableStatus::Err;
        self.job_status.set_failed();
    }

    fn mark_error_with_buffer(&self, buffer_id: usize) {
        {
            let mut state = self.state.lock();
            state.status = TableStatus::Err;
            state.buffers[buffer_id].status = TableStatus::Err;
        }
        self.job_status.set_failed();
    }

    /// Update status after a parse failure.  Sticky: nothing recovers it.
    pub fn set_parse_error(&self) {
        self.mark_error();
    }

    // ========== Parser side ==========

    /// Pick and lock a column of `buffer_id` for `worker`.  Returns `None`
    /// when the buffer is not parseable or every column is taken.  Prefers
    /// the widest never-parsed column, then the slowest column, to keep the
    /// expensive columns off the critical path.
    pub fn get_column_for_parse(
        &self,
        worker: usize,
        buffer_id: usize,
    ) -> Result<Option<usize>> {
        let mut state = self.state.lock();

        if self.job_status.is_failed() {
            state.status = TableStatus::Err;
            return Err(BulkError::JobTerminated(format!(
                "parser {} for table {} responding to job termination",
                worker, self.settings.table_name
            )));
        }

        if state.buffers[buffer_id].status != TableStatus::ReadComplete {
            return Ok(None);
        }

        // Never-parsed columns outrank parsed ones (widest first, to get a
        // real cost sample for the big columns early); among parsed
        // columns, the largest last-parse time wins.
        let mut chosen: Option<usize> = None;
        let mut chosen_never_parsed = false;
        let mut max_time = 0.0f64;

        for k in 0..self.columns.len() {
            if state.buffers[buffer_id].cells[k].locker.is_some() {
                continue;
            }
            let never_parsed = state.last_parse_ms[k] == 0.0;

            match chosen {
                None => {
                    chosen = Some(k);
                    chosen_never_parsed = never_parsed;
                    if !never_parsed {
                        max_time = state.last_parse_ms[k];
                    }
                }
                Some(cur) => {
                    if never_parsed {
                        if !chosen_never_parsed
                            || self.columns[k].column.width >= self.columns[cur].column.width
                        {
                            chosen = Some(k);
                            chosen_never_parsed = true;
                        }
                    } else if !chosen_never_parsed && state.last_parse_ms[k] > max_time {
                        max_time = state.last_parse_ms[k];
                        chosen = Some(k);
                    }
                }
            }
        }

        if let Some(k) = chosen {
            let cell = &mut state.buffers[buffer_id].cells[k];
            cell.locker = Some(worker);
            cell.status = TableStatus::ParseInProgress;
        }

        Ok(chosen)
    }

    /// Parse one locked (buffer, column) pair.  Runs without the table
    /// mutex; returns the elapsed milliseconds for the scheduler heuristic.
    pub fn parse_column(&self, column_id: usize, buffer_id: usize) -> Result<f64> {
        let started = Instant::now();

        let ci = &self.columns[column_id];
        let field_index = if ci.column.is_aux {
            None
        } else {
            Some(column_id)
        };
        self.buffers[buffer_id].parse(ci, field_index)?;

        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }

    /// Mark a (buffer, column) cell parsed; completes the buffer, the
    /// column, and finally the table, running the finalize sequence when
    /// the last column of the last buffer lands.
    pub fn set_parse_complete(
        &self,
        column_id: usize,
        buffer_id: usize,
        elapsed_ms: f64,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if state.status == TableStatus::Err {
            return Err(BulkError::TableInErrorState);
        }

        state.last_parse_ms[column_id] = elapsed_ms;
        state.buffers[buffer_id].cells[column_id].status = TableStatus::ParseComplete;

        if state.buffers[buffer_id]
            .cells
            .iter()
            .all(|c| c.status == TableStatus::ParseComplete)
        {
            state.buffers[buffer_id].status = TableStatus::ParseComplete;
            self.buffer_ready.notify_all();
        }

        if state.last_buffer_id.is_some() {
            let column_done = state.buffers.iter().all(|b| {
                !matches!(
                    b.status,
                    TableStatus::ReadComplete | TableStatus::ParseComplete
                ) || b.cells[column_id].status == TableStatus::ParseComplete
            });

            if column_done {
                let blocks = self.columns[column_id].drain_dict_flush_blocks();
                self.dict_flush_blocks.lock().extend(blocks);

                if let Err(e) = self.columns[column_id].finish_parsing() {
                    log::error!(
                        "setParseComplete completion error; Failed to load table: {}; {}",
                        self.settings.table_name,
                        e
                    );
                    state.status = TableStatus::Err;
                    return Err(e);
                }

                state.cols_parsed += 1;

                if state.cols_parsed >= self.columns.len() {
                    // Finalize does BRM calls and file I/O; the table mutex
                    // must not be held across it.  The cols_parsed
                    // transition above is one-shot, so finalize cannot fire
                    // twice.
                    drop(state);
                    let finalized = self.run_finalize();

                    state = self.state.lock();
                    if let Err(e) = finalized {
                        state.status = TableStatus::Err;
                        return Err(e);
                    }

                    state.status = TableStatus::ParseComplete;
                    let elapsed = (*self.start_time.lock())
                        .map(|t| t.elapsed().as_secs_f64())
                        .unwrap_or(0.0);
                    self.report_totals(elapsed);

                    for buf in &self.buffers {
                        buf.clear();
                    }
                }
            }
        }

        // Advance the parse cursor past finished buffers.
        if state.status != TableStatus::ParseComplete
            && state.buffers[buffer_id].status == TableStatus::ParseComplete
            && buffer_id == state.current_parse_buffer
        {
            let n = self.buffers.len();
            let mut cur = state.current_parse_buffer;
            while state.buffers[cur].status == TableStatus::ParseComplete {
                cur = (cur + 1) % n;
                state.current_parse_buffer = cur;
                if cur == state.current_read_buffer {
                    break;
                }
            }
        }

        Ok(())
    }

    /// The parser-worker contract: repeatedly lock a column, parse it, and
    /// report completion, until the table finishes or fails.
    pub fn run_parser(&self, worker: usize) -> Result<()> {
        loop {
            match self.status() {
                TableStatus::ParseComplete => return Ok(()),
                TableStatus::Err => return Ok(()),
                _ => {}
            }

            let nbuf = self.buffers.len();
            let start = self.current_parse_buffer();
            let mut found = false;

            for off in 0..nbuf {
                let buf = (start + off) % nbuf;
                let col = match self.get_column_for_parse(worker, buf) {
                    Ok(c) => c,
                    Err(BulkError::JobTerminated(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };

                if let Some(col) = col {
                    found = true;
                    match self.parse_column(col, buf) {
                        Ok(ms) => match self.set_parse_complete(col, buf, ms) {
                            Ok(()) => {}
                            Err(BulkError::TableInErrorState) => return Ok(()),
                            Err(e) => {
                                self.set_parse_error();
                                self.job_status.set_failed();
                                return Err(e);
                            }
                        },
                        Err(BulkError::JobTerminated(_)) => return Ok(()),
                        Err(e) => {
                            self.set_parse_error();
                            self.job_status.set_failed();
                            return Err(e);
                        }
                    }
                    break;
                }
            }

            if !found {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    // ========== Parquet fast path ==========

    /// Parquet import: RecordBatches bypass the ring, each column writing
    /// straight through reserve/convert/release, then finalize.
    fn read_parquet_data(&self) -> Result<()> {
        let read_start = Instant::now();
        *self.start_time.lock() = Some(read_start);
        self.processing_begun.store(true, Ordering::Release);

        let mut tele = ImportTeleStats::start(
            self.job_uuid,
            &self.settings.table_name,
            &self.settings.system_name,
            &self.settings.module_name,
        );
        self.tele.post_import(&tele);

        let data_cols: Vec<&Arc<ColumnInfo>> =
            self.columns.iter().filter(|c| !c.column.is_aux).collect();
        let aux_col = self.columns.iter().find(|c| c.column.is_aux);

        let mut global_row = 0u64;
        let mut total_rows = 0u64;

        for path in &self.load_files {
            let mut source = ParquetSource::open(path, self.parquet_batch_size)?;
            log::info!(
                "Opening {} to import into table {} ({} rows)",
                path.display(),
                self.settings.table_name,
                source.total_rows()
            );

            let mut rows_per_file = 0u64;
            let mut progress_marker = 0u64;

            while let Some(batch) = source.next_batch()? {
                if self.job_status.is_failed() {
                    self.mark_error();
                    self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
                    return Err(BulkError::JobTerminated(format!(
                        "parquet reader for table {} responding to job termination",
                        self.settings.table_name
                    )));
                }

                if batch.num_columns() < data_cols.len() {
                    self.mark_error();
                    return Err(BulkError::Parquet(format!(
                        "{}: batch has {} columns, table needs {}",
                        path.display(),
                        batch.num_columns(),
                        data_cols.len()
                    )));
                }

                let rows = batch.num_rows();
                for (k, ci) in data_cols.iter().enumerate() {
                    let result = if ci.column.dictionary.is_some() {
                        parquet::parse_dict_batch(ci, batch.column(k), global_row)
                    } else {
                        parquet::parse_column_batch(ci, batch.column(k), global_row)
                    };
                    if let Err(e) = result {
                        self.mark_error();
                        return Err(e);
                    }
                }

                if let Some(aux) = aux_col {
                    if let Err(e) = parquet::parse_aux_batch(aux, rows, global_row) {
                        self.mark_error();
                        return Err(e);
                    }
                }

                global_row += rows as u64;
                rows_per_file += rows as u64;

                tele.rows_so_far = vec![rows_per_file];
                if rows_per_file / 1_000_000 > progress_marker {
                    progress_marker = rows_per_file / 1_000_000;
                    self.tele
                        .post_import(&tele.event(TeleEventKind::Progress, rows_per_file));
                }
            }

            total_rows += rows_per_file;
        }

        self.total_read_rows.store(total_rows, Ordering::Relaxed);

        for ci in &self.columns {
            let blocks = ci.drain_dict_flush_blocks();
            self.dict_flush_blocks.lock().extend(blocks);
            if let Err(e) = ci.finish_parsing() {
                self.mark_error();
                self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
                return Err(e);
            }
        }

        if let Err(e) = self.run_finalize() {
            self.mark_error();
            self.tele.post_import(&tele.event(TeleEventKind::Term, 0));
            return Err(e);
        }
        self.state.lock().status = TableStatus::ParseComplete;

        self.report_totals(read_start.elapsed().as_secs_f64());
        self.tele
            .post_import(&tele.event(TeleEventKind::Summary, total_rows));

        Ok(())
    }

    // ========== Finalize ==========

    /// End-of-table commit sequence, run exactly once when the last column
    /// of the last buffer (or batch) completes.
    fn run_finalize(&self) -> Result<()> {
        // Sweep up any dictionary blocks recorded since the per-column
        // collection ran.
        for ci in &self.columns {
            let blocks = ci.drain_dict_flush_blocks();
            self.dict_flush_blocks.lock().extend(blocks);
        }

        self.flush_dictionary_blocks();

        self.synchronize_auto_inc().map_err(|e| {
            log::error!(
                "setParseComplete: autoInc update error; Failed to load table: {}; {}",
                self.settings.table_name,
                e
            );
            e
        })?;

        let seg_info: Vec<DbRootExtentInfo> =
            self.columns.iter().map(|c| c.seg_file_info()).collect();
        self.validate_column_hwms(None, &seg_info, "Ending")
            .map_err(|e| {
                log::error!(
                    "setParseComplete: HWM validation error; Failed to load table: {}; {}",
                    self.settings.table_name,
                    e
                );
                for (ci, info) in self.columns.iter().zip(&seg_info) {
                    log::info!(
                        "  {}; DBRoot/part/seg/hwm: {}/{}/{}/{}",
                        ci.column.name,
                        info.dbroot,
                        info.partition,
                        info.segment,
                        info.local_hwm
                    );
                }
                e
            })?;

        self.confirm_db_file_changes()?;
        self.finish_brm()?;
        self.change_table_lock_state()?;
        self.delete_temp_db_file_changes();
        self.delete_meta_data_rollback_file();
        self.release_table_lock()?;

        Ok(())
    }

    /// Invalidate imported dictionary blocks in the upstream block cache.
    /// The cache is an external collaborator; locally this only reports.
    fn flush_dictionary_blocks(&self) {
        let blocks: Vec<Lbid> = std::mem::take(&mut *self.dict_flush_blocks.lock());
        if !blocks.is_empty() {
            log::debug!(
                "Dictionary cache flush for table {}: {} blocks",
                self.settings.table_name,
                blocks.len()
            );
        }
    }

    /// Publish the final auto-increment next-value for the one
    /// auto-increment column, if any.
    fn synchronize_auto_inc(&self) -> Result<()> {
        for ci in &self.columns {
            if ci.column.auto_increment {
                ci.finish_auto_inc()?;
                break; // at most one auto-increment column per table
            }
        }
        Ok(())
    }

    /// Push per-column HWM and extent-range updates to the BRM, or to the
    /// report file in distributed mode.
    fn finish_brm(&self) -> Result<()> {
        let (err_files, bad_files) = {
            let reject = self.reject.lock();
            (reject.sink.err_files.clone(), reject.sink.bad_files.clone())
        };

        if self.settings.bulk_mode == BulkMode::RemoteSingleSrc {
            let path = self.settings.brm_report_path.as_ref().ok_or_else(|| {
                BulkError::Brm("distributed import requires a BRM report path".to_string())
            })?;
            return self.write_brm_report(path, &err_files, &bad_files);
        }

        for ci in &self.columns {
            ci.publish_brm_updates().map_err(|e| {
                log::error!(
                    "setParseComplete: BRM error; Failed to load table: {}; {}",
                    self.settings.table_name,
                    e
                );
                e
            })?;
        }

        Ok(())
    }

    fn write_brm_report(
        &self,
        path: &Path,
        err_files: &[PathBuf],
        bad_files: &[PathBuf],
    ) -> Result<()> {
        let mut out = std::io::BufWriter::new(File::create(path)?);

        for ci in &self.columns {
            for update in ci.brm_updates() {
                match update {
                    BrmUpdate::LocalHwm {
                        oid,
                        partition,
                        segment,
                        hwm,
                    } => writeln!(out, "HWM: {} {} {} {}", oid, partition, segment, hwm)?,
                    BrmUpdate::ExtentRange {
                        start_lbid,
                        min,
                        max,
                        any_values,
                    } => writeln!(out, "CP: {} {} {} {}", start_lbid, min, max, any_values)?,
                    BrmUpdate::WideExtentRange {
                        start_lbid,
                        min,
                        max,
                        any_values,
                    } => writeln!(out, "WCP: {} {} {} {}", start_lbid, min, max, any_values)?,
                }
            }
        }
        for f in err_files {
            writeln!(out, "ERR: {}", f.display())?;
        }
        for f in bad_files {
            writeln!(out, "BAD: {}", f.display())?;
        }

        out.flush()?;
        Ok(())
    }

    /// List the reject files in the BRM report when the error budget blows;
    /// the coordinator surfaces them to the user.
    fn report_reject_files(&self, err_files: &[PathBuf], bad_files: &[PathBuf]) {
        if self.settings.bulk_mode == BulkMode::RemoteSingleSrc {
            if let Some(path) = &self.settings.brm_report_path {
                if let Err(e) = self.write_brm_report(path, err_files, bad_files) {
                    log::error!("Unable to write BRM report {}: {}", path.display(), e);
                }
            }
        }
    }

    /// HDFS two-phase commit: promote temp swap files to live files.  On
    /// local storage there is nothing to confirm.
    fn confirm_db_file_changes(&self) -> Result<()> {
        Ok(())
    }

    /// HDFS cleanup of temp swap files; a no-op on local storage.
    fn delete_temp_db_file_changes(&self) {}

    /// Report end-of-table totals and per-column saturation warnings.
    fn report_totals(&self, elapsed_secs: f64) {
        let total = self.total_read_rows.load(Ordering::Relaxed);
        let errs = self.reject.lock().total_err_rows;

        log::info!(
            "For table {}: {} rows processed and {} rows inserted.",
            self.settings.table_name,
            total,
            total - errs
        );
        log::info!(
            "For table {}: Elapsed time to load this table: {:.3} secs",
            self.settings.table_name,
            elapsed_secs
        );

        for ci in &self.columns {
            let sat = ci.saturated_count();
            if sat == 0 {
                continue;
            }
            let what = match ci.column.logical {
                LogicalKind::Date => "invalid dates replaced with zero value",
                LogicalKind::DateTime => "invalid date/times replaced with zero value",
                LogicalKind::Timestamp => "invalid timestamps replaced with zero value",
                LogicalKind::Time => "invalid times replaced with zero value",
                LogicalKind::Char | LogicalKind::VarChar => "character strings truncated",
                _ => "rows inserted with saturated values",
            };
            log::warn!(
                "Column {}.{}; Number of {}: {}",
                self.settings.table_name,
                ci.column.name,
                what,
                sat
            );
        }
    }

    // ========== HWM validation ==========

    /// Validate that the HWMs of all columns are mutually consistent:
    /// equal within a width class, and within the arithmetic range implied
    /// by the narrower widths across classes.
    pub fn validate_column_hwms(
        &self,
        job_cols: Option<&[JobColumn]>,
        seg_info: &[DbRootExtentInfo],
        stage: &str,
    ) -> Result<()> {
        let col = |k: usize| -> &JobColumn {
            match job_cols {
                Some(cols) => &cols[k],
                None => &self.columns[k].column,
            }
        };

        // First column seen of each width class is the reference.
        let mut first_of: [Option<usize>; 5] = [None; 5];
        let class_of = |width: usize| -> Option<usize> {
            match width {
                1 => Some(0),
                2 => Some(1),
                4 => Some(2),
                8 => Some(3),
                16 => Some(4),
                _ => None,
            }
        };

        for k in 0..seg_info.len() {
            let width = col(k).width;
            let class = class_of(width).ok_or_else(|| {
                log::error!(
                    "{} Unsupported width for OID-{}; column-{}; width-{}",
                    stage,
                    col(k).oid,
                    col(k).name,
                    width
                );
                BulkError::UnsupportedWidth {
                    stage: stage.to_string(),
                    col: col(k).name.clone(),
                    width,
                }
            })?;

            let k1 = *first_of[class].get_or_insert(k);

            if seg_info[k1] != seg_info[k] {
                log::error!(
                    "{} HWMs do not match for OID1-{}; column-{}; \
                     DBRoot/part/seg/hwm {}/{}/{}/{} and OID2-{}; column-{}; \
                     DBRoot/part/seg/hwm {}/{}/{}/{}",
                    stage,
                    col(k1).oid,
                    col(k1).name,
                    seg_info[k1].dbroot,
                    seg_info[k1].partition,
                    seg_info[k1].segment,
                    seg_info[k1].local_hwm,
                    col(k).oid,
                    col(k).name,
                    seg_info[k].dbroot,
                    seg_info[k].partition,
                    seg_info[k].segment,
                    seg_info[k].local_hwm
                );
                return Err(BulkError::HwmsNotEqual {
                    stage: stage.to_string(),
                    col1: col(k1).name.clone(),
                    col2: col(k).name.clone(),
                });
            }

            // Every column shares one DBRoot/partition/segment.
            if seg_info[0].dbroot != seg_info[k].dbroot
                || seg_info[0].partition != seg_info[k].partition
                || seg_info[0].segment != seg_info[k].segment
            {
                return Err(BulkError::HwmsNotEqual {
                    stage: stage.to_string(),
                    col1: col(0).name.clone(),
                    col2: col(k).name.clone(),
                });
            }
        }

        // Compare across width classes: narrower reference bounds the wider.
        let widths = [1usize, 2, 4, 8, 16];
        for a in 0..widths.len() {
            let Some(ka) = first_of[a] else { continue };
            for b in (a + 1)..widths.len() {
                let Some(kb) = first_of[b] else { continue };

                let multiplier = (widths[b] / widths[a]) as u64;
                let hwm_lo = seg_info[ka].local_hwm * multiplier;
                let hwm_hi = hwm_lo + multiplier - 1;
                let wider = seg_info[kb].local_hwm;

                if wider < hwm_lo || wider > hwm_hi {
                    log::error!(
                        "{} HWMs are not in sync for OID1-{}; column-{}; hwm-{}; width-{} \
                         and OID2-{}; column-{}; hwm-{}; width-{}",
                        stage,
                        col(ka).oid,
                        col(ka).name,
                        seg_info[ka].local_hwm,
                        widths[a],
                        col(kb).oid,
                        col(kb).name,
                        wider,
                        widths[b]
                    );
                    return Err(BulkError::HwmsOutOfSync {
                        stage: stage.to_string(),
                        col1: col(ka).name.clone(),
                        col2: col(kb).name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    // ========== Table lock lifecycle ==========

    /// Acquire the table lock, retrying every 100 ms for up to the
    /// configured wait period (or forever with `disable_timeout`).
    pub fn acquire_table_lock(&self, disable_timeout: bool) -> Result<()> {
        *self.orig_dbroots.lock() = self.brm.root_id_list();

        // The coordinator owns locks in the distributed modes.
        if self.settings.bulk_mode.coordinator_owned() {
            log::debug!(
                "Bypass acquiring table lock in distributed mode, for table {}; OID-{}",
                self.settings.table_name,
                self.settings.table_oid
            );
            return Ok(());
        }

        let owner = LockOwner {
            name: format!("{} (pm{})", self.settings.process_name, self.module_id),
            pid: std::process::id(),
            session_id: -1,
            txn_id: self.settings.txn_id,
        };

        let tries_per_sec = 1000 / LOCK_RETRY_MS;
        let max_tries = self.wait_period_secs * tries_per_sec;
        let mut try_count = 0u64;

        loop {
            match self
                .brm
                .get_table_lock(self.settings.table_oid, owner.clone())?
            {
                Some(lock_id) => {
                    self.table_lock_id.store(lock_id, Ordering::Release);
                    self.table_locked.store(true, Ordering::Release);
                    log::debug!(
                        "Table lock acquired for table {}; OID-{}; lockID-{}",
                        self.settings.table_name,
                        self.settings.table_oid,
                        lock_id
                    );
                    return Ok(());
                }
                None => {
                    try_count += 1;
                    if !disable_timeout && try_count >= max_tries {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        let holder = self
            .brm
            .table_lock_owner(self.settings.table_oid)
            .map(|o| o.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        log::error!(
            "Unable to acquire lock for table {}; OID-{}; table currently locked by {}",
            self.settings.table_name,
            self.settings.table_oid,
            holder
        );

        Err(BulkError::TableLockTimeout {
            table: self.settings.table_name.clone(),
            owner: holder,
        })
    }

    /// Move the held lock to the cleanup state before releasing it.
    pub fn change_table_lock_state(&self) -> Result<()> {
        if self.settings.bulk_mode.coordinator_owned() {
            return Ok(());
        }

        let lock_id = self.table_lock_id.load(Ordering::Acquire);
        let changed = self
            .brm
            .change_table_lock_state(lock_id, TableLockState::Cleanup)
            .map_err(|e| {
                log::error!(
                    "Error in changing table state for table {}; lockID-{}; {}",
                    self.settings.table_name,
                    lock_id,
                    e
                );
                e
            })?;

        if !changed {
            log::debug!(
                "Table lock state not changed to CLEANUP for table {}; lockID-{}. Table not locked.",
                self.settings.table_name,
                lock_id
            );
        }

        Ok(())
    }

    /// Release the table lock.  Safe to call twice: the second release
    /// reports not-locked and succeeds.
    pub fn release_table_lock(&self) -> Result<()> {
        if self.settings.bulk_mode.coordinator_owned() {
            log::debug!(
                "Bypass releasing table lock in distributed mode, for table {}; OID-{}",
                self.settings.table_name,
                self.settings.table_oid
            );
            return Ok(());
        }

        let lock_id = self.table_lock_id.load(Ordering::Acquire);
        let released = self.brm.release_table_lock(lock_id).map_err(|e| {
            log::error!(
                "Error in releasing table lock for table {}; lockID-{}; {}",
                self.settings.table_name,
                lock_id,
                e
            );
            e
        })?;

        self.table_locked.store(false, Ordering::Release);

        if !released {
            log::debug!(
                "Table lock not released for table {}; lockID-{}. Table not locked.",
                self.settings.table_name,
                lock_id
            );
        }

        Ok(())
    }

    pub fn is_table_locked(&self) -> bool {
        self.table_locked.load(Ordering::Acquire)
    }

    // ========== Bulk rollback ==========

    /// Create the rollback metadata file for this table.
    pub fn init_bulk_rollback_meta(&self) -> Result<()> {
        if self.settings.bulk_mode.coordinator_owned() {
            return Ok(());
        }
        self.rb_meta
            .lock()
            .init(self.settings.table_oid, &self.settings.meta_dir)
    }

    /// Snapshot every column's starting location and on-disk files.  Must
    /// run before any user data is written.
    pub fn save_bulk_rollback_meta(&self) -> Result<()> {
        if self.settings.bulk_mode.coordinator_owned() {
            return Ok(());
        }

        let mut columns = Vec::with_capacity(self.columns.len());
        for ci in &self.columns {
            let dictionary_oid = ci.column.dictionary.as_ref().map(|d| d.oid);
            columns.push(ColumnSnapshot {
                oid: ci.column.oid,
                width: ci.column.width,
                dictionary_oid,
                start: ci.seg_file_info(),
                files: snapshot_column_files(
                    &self.settings.base_dir,
                    ci.column.oid,
                    dictionary_oid,
                )?,
            });
        }

        let meta = RollbackMeta {
            table_oid: self.settings.table_oid,
            table_name: self.settings.table_name.clone(),
            process_name: self.settings.process_name.clone(),
            pid: std::process::id(),
            dbroots: self.orig_dbroots.lock().clone(),
            columns,
        };

        self.rb_meta.lock().save(&meta)
    }

    fn delete_meta_data_rollback_file(&self) {
        if self.settings.bulk_mode.coordinator_owned() || self.settings.keep_rb_meta {
            return;
        }
        if let Err(e) = self.rb_meta.lock().delete() {
            log::error!("Error deleting meta file; {}", e);
        }
    }

    /// Roll back this table after abnormal termination: restore every
    /// touched segment file from the pre-import snapshot, delete the
    /// metadata file, and release the table lock.
    pub fn rollback_work(&self) -> Result<()> {
        log::info!(
            "Closing DB files for table {}, left open by abnormal termination.",
            self.settings.table_name
        );
        for ci in &self.columns {
            ci.close_open_files();
        }

        // A DBRoot that moved away since job start makes a local rollback
        // unsafe; the operator must run cleartablelock across nodes.
        let current_roots = self.brm.root_id_list();
        for root in self.orig_dbroots.lock().iter() {
            if !current_roots.contains(root) {
                let err = BulkError::RollbackMissingRoot {
                    table: self.settings.table_name.clone(),
                    dbroot: *root,
                };
                log::error!("{}", err);
                return Err(err);
            }
        }

        if self.has_processing_begun() {
            let meta_path = self
                .rb_meta
                .lock()
                .path()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| {
                    BulkError::Rollback("no rollback metadata file for this table".to_string())
                })?;

            let mgr = BulkRollbackManager::new(&self.settings.table_name);
            mgr.rollback(&meta_path, &self.settings.base_dir, true)
                .map_err(|e| {
                    log::error!(
                        "Error rolling back table {}; {}",
                        self.settings.table_name,
                        e
                    );
                    e
                })?;
        }

        self.delete_meta_data_rollback_file();

        self.release_table_lock().map_err(|e| {
            log::error!("Table lock not cleared for table {}", self.settings.table_name);
            e
        })?;

        Ok(())
    }
}
