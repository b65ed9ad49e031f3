//! Per-column runtime state for one import job.
//!
//! A `ColumnInfo` owns the column's buffer manager (and dictionary writer
//! for token columns), accumulates the per-extent min/max ranges that feed
//! the casual-partition metadata, and tracks saturation and auto-increment
//! bookkeeping.  Parser workers share it behind an `Arc`; the pieces they
//! touch concurrently are individually locked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::brm::{BrmClient, ExtentStripeAllocator, Lbid};
use crate::bulk::column_buffer::ColumnBufferManager;
use crate::bulk::convert::{AutoIncRange, BufferStats};
use crate::bulk::dictionary::DictionaryWriter;
use crate::bulk::JobStatus;
use crate::data::{DbRootExtentInfo, JobColumn, StorageKind};
use crate::Result;

/// One end-of-job BRM publication record.
#[derive(Debug, Clone, PartialEq)]
pub enum BrmUpdate {
    LocalHwm {
        oid: u32,
        partition: u32,
        segment: u16,
        hwm: u64,
    },
    ExtentRange {
        start_lbid: Lbid,
        min: i64,
        max: i64,
        any_values: bool,
    },
    WideExtentRange {
        start_lbid: Lbid,
        min: i128,
        max: i128,
        any_values: bool,
    },
}

/// Runtime state of one column during a bulk import.
pub struct ColumnInfo {
    pub column: JobColumn,
    mgr: ColumnBufferManager,
    dictionary: Option<Mutex<DictionaryWriter>>,
    brm: Arc<dyn BrmClient>,
    /// Extent range accumulators keyed by the extent's last input row.
    cp: Mutex<BTreeMap<u64, BufferStats>>,
    saturated: AtomicU64,
}

impl ColumnInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        column: JobColumn,
        base_dir: &Path,
        brm: Arc<dyn BrmClient>,
        alloc: Arc<ExtentStripeAllocator>,
        job_status: Arc<JobStatus>,
        block_size: usize,
        dict_blocks_per_extent: u64,
    ) -> Result<Self> {
        let mgr = ColumnBufferManager::new(
            column.oid,
            column.width,
            base_dir,
            alloc,
            job_status,
            block_size,
        );

        let dictionary = match &column.dictionary {
            Some(info) => Some(Mutex::new(DictionaryWriter::open(
                info.oid,
                base_dir,
                Arc::clone(&brm),
                block_size,
                dict_blocks_per_extent,
            )?)),
            None => None,
        };

        Ok(Self {
            column,
            mgr,
            dictionary,
            brm,
            cp: Mutex::new(BTreeMap::new()),
            saturated: AtomicU64::new(0),
        })
    }

    pub fn mgr(&self) -> &ColumnBufferManager {
        &self.mgr
    }

    pub fn rows_per_extent(&self) -> u64 {
        self.mgr.rows_per_extent()
    }

    // ========== Saturation ==========

    pub fn inc_saturated(&self, n: u64) {
        if n > 0 {
            self.saturated.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn saturated_count(&self) -> u64 {
        self.saturated.load(Ordering::Relaxed)
    }

    // ========== Extent ranges ==========

    /// Merge one section's accumulated range into the extent identified by
    /// its last input row.
    pub fn update_cp(&self, last_row_in_extent: u64, stats: &BufferStats) {
        let mut cp = self.cp.lock();
        let entry = cp
            .entry(last_row_in_extent)
            .or_insert_with(|| BufferStats::new(&self.column));

        if stats.any_values() {
            entry.fold(stats.min);
            entry.fold(stats.max);
        }
        if self.column.width > 8 {
            entry.fold_wide(stats.wide_min);
            entry.fold_wide(stats.wide_max);
        }
    }

    // ========== Auto-increment ==========

    /// Reserve a block of auto-increment values for one chunk's nulls.
    pub fn reserve_auto_inc(&self, count: u64) -> Result<AutoIncRange> {
        let first = self.brm.reserve_auto_inc(self.column.oid, count)?;
        Ok(AutoIncRange::new(first, count))
    }

    /// Publish the final next-value to the system catalog.
    pub fn finish_auto_inc(&self) -> Result<()> {
        let next = self.brm.auto_inc_next_value(self.column.oid)?;
        self.brm.update_auto_inc_catalog(self.column.oid, next)
    }

    // ========== Dictionary ==========

    /// Tokenize a chunk of strings, appending 8-byte tokens to `out`.
    /// Over-length values are truncated at a UTF-8 boundary and counted.
    pub fn tokenize(&self, values: &[Option<&[u8]>], out: &mut Vec<u8>) -> Result<()> {
        let dict = self
            .dictionary
            .as_ref()
            .expect("tokenize called on a non-dictionary column");
        let mut dict = dict.lock();

        let mut truncated = 0u64;
        for value in values {
            let token = match value {
                None => dict.token_for(None)?,
                Some(bytes) => {
                    let keep = crate::bulk::convert::utf8_truncate_len(
                        bytes,
                        self.column.defined_width,
                    );
                    if keep < bytes.len() {
                        truncated += 1;
                    }
                    dict.token_for(Some(&bytes[..keep]))?
                }
            };
            out.extend_from_slice(&token.to_le_bytes());
        }

        self.inc_saturated(truncated);
        Ok(())
    }

    /// Drain the dictionary store blocks written since the last drain, for
    /// upstream cache invalidation.
    pub fn drain_dict_flush_blocks(&self) -> Vec<Lbid> {
        match &self.dictionary {
            Some(dict) => dict.lock().drain_flush_blocks(),
            None => Vec::new(),
        }
    }

    // ========== Lifecycle ==========

    /// Close any files left open by abnormal termination, without the
    /// end-of-job checks, so a bulk rollback can reopen and restore them.
    pub fn close_open_files(&self) {
        self.mgr.abandon();
        if let Some(dict) = &self.dictionary {
            if let Err(e) = dict.lock().finish() {
                log::error!(
                    "Error closing dictionary store for column {}: {}",
                    self.column.name,
                    e
                );
            }
        }
    }

    /// Close the column's segment files (and dictionary store).
    pub fn finish_parsing(&self) -> Result<()> {
        self.mgr.finish()?;
        if let Some(dict) = &self.dictionary {
            dict.lock().finish()?;
        }
        Ok(())
    }

    /// Location and HWM of the column's current segment file.
    pub fn seg_file_info(&self) -> DbRootExtentInfo {
        self.mgr.current_seg_info()
    }

    /// Every file this column touched: segment files plus the dictionary
    /// store, for rollback snapshots and cleanup.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.mgr.file_paths();
        if let Some(dict) = &self.dictionary {
            paths.push(dict.lock().store_path().to_path_buf());
        }
        paths
    }

    /// Collect this column's end-of-job HWM and extent-range publications.
    pub fn brm_updates(&self) -> Vec<BrmUpdate> {
        let mut updates = Vec::new();
        let rows_per_extent = self.mgr.rows_per_extent();
        let cp = self.cp.lock();

        for (idx, (start_lbid, partition, segment, hwm)) in
            self.mgr.extent_records().into_iter().enumerate()
        {
            updates.push(BrmUpdate::LocalHwm {
                oid: self.column.oid,
                partition,
                segment,
                hwm,
            });

            // Token columns carry no range metadata.
            if self.column.storage == StorageKind::Token {
                continue;
            }

            let last_row = (idx as u64 + 1) * rows_per_extent - 1;
            let identity = BufferStats::new(&self.column);
            let stats = cp.get(&last_row).unwrap_or(&identity);

            if self.column.width > 8 {
                updates.push(BrmUpdate::WideExtentRange {
                    start_lbid,
                    min: stats.wide_min,
                    max: stats.wide_max,
                    any_values: stats.any_values(),
                });
            } else {
                updates.push(BrmUpdate::ExtentRange {
                    start_lbid,
                    min: stats.min,
                    max: stats.max,
                    any_values: stats.any_values(),
                });
            }
        }

        updates
    }

    /// Apply the collected updates directly to the BRM.
    pub fn publish_brm_updates(&self) -> Result<()> {
        for update in self.brm_updates() {
            match update {
                BrmUpdate::LocalHwm {
                    oid,
                    partition,
                    segment,
                    hwm,
                } => self.brm.set_local_hwm(oid, partition, segment, hwm)?,
                BrmUpdate::ExtentRange {
                    start_lbid,
                    min,
                    max,
                    ..
                } => self.brm.set_extent_range(start_lbid, min, max)?,
                BrmUpdate::WideExtentRange {
                    start_lbid,
                    min,
                    max,
                    ..
                } => self.brm.set_extent_range_wide(start_lbid, min, max)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brm::LocalBrm;
    use crate::data::LogicalKind;
    use tempfile::tempdir;

    fn mk_column(dir: &Path, column: JobColumn) -> ColumnInfo {
        let brm = LocalBrm::new(vec![1]);
        let alloc = Arc::new(ExtentStripeAllocator::new(
            3000,
            Arc::clone(&brm) as Arc<dyn BrmClient>,
            1024,
            8192,
        ));
        alloc.add_column(column.oid, column.width);
        ColumnInfo::new(
            column,
            dir,
            brm,
            alloc,
            Arc::new(JobStatus::new()),
            8192,
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_cp_merges_sections() {
        let dir = tempdir().unwrap();
        let col = JobColumn::new("i", 101, StorageKind::Int, LogicalKind::Int);
        let ci = mk_column(dir.path(), col.clone());

        let mut a = BufferStats::new(&col);
        a.fold(5);
        a.fold(10);
        ci.update_cp(2047, &a);

        let mut b = BufferStats::new(&col);
        b.fold(-3);
        ci.update_cp(2047, &b);

        let merged = ci.cp.lock().get(&2047).unwrap().clone();
        assert_eq!((merged.min, merged.max), (-3, 10));
    }

    #[test]
    fn test_saturated_count_monotonic() {
        let dir = tempdir().unwrap();
        let ci = mk_column(
            dir.path(),
            JobColumn::new("i", 101, StorageKind::Int, LogicalKind::Int),
        );

        ci.inc_saturated(3);
        ci.inc_saturated(0);
        ci.inc_saturated(2);
        assert_eq!(ci.saturated_count(), 5);
    }

    #[test]
    fn test_tokenize_truncates_and_counts() {
        let dir = tempdir().unwrap();
        let ci = mk_column(dir.path(), JobColumn::new_dict("s", 101, 2001, 5));

        let mut out = Vec::new();
        ci.tokenize(
            &[
                Some(b"short".as_slice()),
                Some(b"way too long value".as_slice()),
                None,
            ],
            &mut out,
        )
        .unwrap();

        assert_eq!(out.len(), 24);
        assert_eq!(ci.saturated_count(), 1);

        let null_token = u64::from_le_bytes(out[16..24].try_into().unwrap());
        assert_eq!(null_token, crate::data::nulls::DICT_NULL_TOKEN);
    }

    #[test]
    fn test_brm_updates_cover_written_extents() {
        let dir = tempdir().unwrap();
        let col = JobColumn::new("i", 101, StorageKind::Byte, LogicalKind::Int);
        let ci = mk_column(dir.path(), col.clone());

        // Write one extent's worth of data through the manager.
        let (mut s, last_row) = ci.mgr().reserve(0, 16).unwrap();
        let n = s.row_count();
        s.write(&vec![7u8; n], n);
        ci.mgr().release(s).unwrap();

        let mut stats = BufferStats::new(&col);
        stats.fold(7);
        ci.update_cp(last_row, &stats);
        ci.finish_parsing().unwrap();

        let updates = ci.brm_updates();
        assert_eq!(updates.len(), 2);
        assert!(matches!(updates[0], BrmUpdate::LocalHwm { .. }));
        match &updates[1] {
            BrmUpdate::ExtentRange { min, max, any_values, .. } => {
                assert_eq!((*min, *max), (7, 7));
                assert!(any_values);
            }
            other => panic!("unexpected update {:?}", other),
        }
    }
}
