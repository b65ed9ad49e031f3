//! Per-column append-only buffer manager.
//!
//! The manager owns a column's current output extent and hands parser
//! workers contiguous write regions ("sections") in strict input-row order.
//! Workers fill their section without holding any lock; `release` flushes
//! the longest contiguous prefix of finished sections to the segment file,
//! so bytes always land on disk in input-row order even when sections
//! complete out of order.
//!
//! A reservation never spans an extent boundary: `reserve` grants at most
//! the rows remaining in the current extent, and the caller loops, letting
//! the casual-partition accumulator roll over between sections.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::brm::{ExtentAlloc, ExtentStripeAllocator, Lbid};
use crate::bulk::JobStatus;
use crate::data::DbRootExtentInfo;
use crate::{BulkError, Result};

/// A contiguous write region within one extent, issued to one parser.
pub struct ColumnBufferSection {
    start_row: u64,
    row_count: usize,
    width: usize,
    extent_idx: usize,
    buf: Vec<u8>,
}

impl ColumnBufferSection {
    pub fn start_row(&self) -> u64 {
        self.start_row
    }

    /// Rows granted to this section.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Append `rows` converted values (exactly `rows * width` bytes).
    pub fn write(&mut self, data: &[u8], rows: usize) {
        debug_assert_eq!(data.len(), rows * self.width);
        self.buf.extend_from_slice(data);
    }

    fn rows_written(&self) -> usize {
        self.buf.len() / self.width
    }
}

struct ExtentFile {
    alloc: ExtentAlloc,
    path: PathBuf,
    file: Option<BufWriter<File>>,
    rows_flushed: u64,
}

struct Pending {
    start_row: u64,
    row_count: usize,
    extent_idx: usize,
    data: Option<Vec<u8>>,
}

struct MgrState {
    next_reserve_row: u64,
    reserved_in_extent: u64,
    extents: Vec<ExtentFile>,
    pending: VecDeque<Pending>,
    closed: bool,
}

/// Append-only writer owning one column's output extents.
pub struct ColumnBufferManager {
    col_oid: u32,
    width: usize,
    rows_per_extent: u64,
    block_size: usize,
    base_dir: PathBuf,
    alloc: Arc<ExtentStripeAllocator>,
    job_status: Arc<JobStatus>,
    state: Mutex<MgrState>,
    in_order: Condvar,
}

impl ColumnBufferManager {
    pub fn new(
        col_oid: u32,
        width: usize,
        base_dir: &Path,
        alloc: Arc<ExtentStripeAllocator>,
        job_status: Arc<JobStatus>,
        block_size: usize,
    ) -> Self {
        let rows_per_extent = alloc.rows_per_extent(width);
        Self {
            col_oid,
            width,
            rows_per_extent,
            block_size,
            base_dir: base_dir.to_path_buf(),
            alloc,
            job_status,
            state: Mutex::new(MgrState {
                next_reserve_row: 0,
                reserved_in_extent: 0,
                extents: Vec::new(),
                pending: VecDeque::new(),
                closed: false,
            }),
            in_order: Condvar::new(),
        }
    }

    pub fn rows_per_extent(&self) -> u64 {
        self.rows_per_extent
    }

    /// Reserve up to `requested` rows starting at global input row
    /// `start_row`.  Blocks until all earlier rows have been reserved, so
    /// sections are issued in strict input-row order.  Returns the section
    /// and the global index of the last row in the section's extent.
    pub fn reserve(
        &self,
        start_row: u64,
        requested: usize,
    ) -> Result<(ColumnBufferSection, u64)> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(BulkError::Brm(format!(
                "column OID {} reserved after close",
                self.col_oid
            )));
        }

        while state.next_reserve_row != start_row {
            if self.job_status.is_failed() {
                return Err(BulkError::JobTerminated(format!(
                    "column OID {} reserve abandoned",
                    self.col_oid
                )));
            }
            if start_row < state.next_reserve_row {
                return Err(BulkError::Brm(format!(
                    "section for row {} already reserved (next is {})",
                    start_row, state.next_reserve_row
                )));
            }
            self.in_order
                .wait_for(&mut state, Duration::from_millis(50));
        }

        // Open the next extent when none is open or the current one is full.
        if state.extents.is_empty() || state.reserved_in_extent == self.rows_per_extent {
            let alloc = self.alloc.allocate_extent(self.col_oid)?;
            let path = self.segment_path(&alloc);
            let file = BufWriter::with_capacity(
                256 * 1024,
                OpenOptions::new().create(true).append(true).open(&path)?,
            );
            state.extents.push(ExtentFile {
                alloc,
                path,
                file: Some(file),
                rows_flushed: 0,
            });
            state.reserved_in_extent = 0;
        }

        let extent_idx = state.extents.len() - 1;
        let remaining = self.rows_per_extent - state.reserved_in_extent;
        let granted = (requested as u64).min(remaining) as usize;
        let last_row_in_extent = (extent_idx as u64 + 1) * self.rows_per_extent - 1;

        state.next_reserve_row += granted as u64;
        state.reserved_in_extent += granted as u64;
        state.pending.push_back(Pending {
            start_row,
            row_count: granted,
            extent_idx,
            data: None,
        });

        self.in_order.notify_all();

        Ok((
            ColumnBufferSection {
                start_row,
                row_count: granted,
                width: self.width,
                extent_idx,
                buf: Vec::with_capacity(granted * self.width),
            },
            last_row_in_extent,
        ))
    }

    /// Hand back a filled section.  Flushes every leading finished section
    /// to its segment file, keeping on-disk order equal to input-row order.
    pub fn release(&self, section: ColumnBufferSection) -> Result<()> {
        if section.rows_written() != section.row_count {
            return Err(BulkError::Brm(format!(
                "section at row {} released with {} of {} rows written",
                section.start_row,
                section.rows_written(),
                section.row_count
            )));
        }

        let mut state = self.state.lock();

        let slot = state
            .pending
            .iter_mut()
            .find(|p| p.start_row == section.start_row && p.extent_idx == section.extent_idx)
            .ok_or_else(|| {
                BulkError::Brm(format!(
                    "released section at row {} was never reserved",
                    section.start_row
                ))
            })?;
        slot.data = Some(section.buf);

        while let Some(front) = state.pending.front() {
            if front.data.is_none() {
                break;
            }
            let done = state.pending.pop_front().expect("checked front");
            let extent = &mut state.extents[done.extent_idx];
            let file = extent.file.as_mut().expect("extent still open");
            file.write_all(done.data.as_deref().expect("checked data"))?;
            extent.rows_flushed += done.row_count as u64;
        }

        Ok(())
    }

    /// Flush buffered bytes and close every extent file.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock();

        if !state.pending.is_empty() {
            return Err(BulkError::Brm(format!(
                "column OID {} finished with {} unreleased sections",
                self.col_oid,
                state.pending.len()
            )));
        }

        for extent in state.extents.iter_mut() {
            if let Some(mut file) = extent.file.take() {
                file.flush()?;
                file.get_ref().sync_all()?;
            }
        }
        state.closed = true;

        Ok(())
    }

    /// Close files without the end-of-job ordering checks.  Used before a
    /// bulk rollback reopens and restores them; outstanding sections are
    /// discarded, since the rollback truncates past them anyway.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        for extent in state.extents.iter_mut() {
            if let Some(mut file) = extent.file.take() {
                let _ = file.flush();
            }
        }
        state.closed = true;
    }

    /// Location and HWM of the current (latest) segment file.
    pub fn current_seg_info(&self) -> DbRootExtentInfo {
        let state = self.state.lock();
        match state.extents.last() {
            Some(extent) => DbRootExtentInfo {
                dbroot: extent.alloc.dbroot,
                partition: extent.alloc.partition,
                segment: extent.alloc.segment,
                local_hwm: self.hwm_for_rows(extent.rows_flushed),
            },
            None => DbRootExtentInfo::default(),
        }
    }

    /// `(start_lbid, partition, segment, hwm)` for every extent written, in
    /// extent order; consumed by the end-of-job BRM publication.
    pub fn extent_records(&self) -> Vec<(Lbid, u32, u16, u64)> {
        let state = self.state.lock();
        state
            .extents
            .iter()
            .map(|e| {
                (
                    e.alloc.start_lbid,
                    e.alloc.partition,
                    e.alloc.segment,
                    self.hwm_for_rows(e.rows_flushed),
                )
            })
            .collect()
    }

    /// Paths of every segment file this manager created.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.state.lock().extents.iter().map(|e| e.path.clone()).collect()
    }

    fn hwm_for_rows(&self, rows: u64) -> u64 {
        if rows == 0 {
            0
        } else {
            (rows * self.width as u64 - 1) / self.block_size as u64
        }
    }

    fn segment_path(&self, alloc: &ExtentAlloc) -> PathBuf {
        segment_file_path(
            &self.base_dir,
            self.col_oid,
            alloc.dbroot,
            alloc.partition,
            alloc.segment,
        )
    }
}

/// Canonical segment-file path for a column extent.
pub fn segment_file_path(
    base_dir: &Path,
    col_oid: u32,
    dbroot: u16,
    partition: u32,
    segment: u16,
) -> PathBuf {
    base_dir.join(format!(
        "FILE{:06}.{}.{}.{}.cdf",
        col_oid, dbroot, partition, segment
    ))
}
