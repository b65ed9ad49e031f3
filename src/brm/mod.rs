//! Block Resolution Manager client.
//!
//! The BRM owns extent allocation, logical block ids, high water marks,
//! extent min/max ranges, table locks, and auto-increment sequences.  The
//! import pipeline talks to it through [`BrmClient`]; [`LocalBrm`] is the
//! in-process implementation used for local (mode 3) imports and tests.
//!
//! Extents are allocated a stripe at a time: one call hands every column of
//! a table its next extent, all sharing the same DBRoot, partition, and
//! segment so the per-width HWM invariants hold across the table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BulkError, Result};

/// Logical block id issued by the BRM.
pub type Lbid = u64;

/// One column's share of an allocated stripe.
#[derive(Debug, Clone, Copy)]
pub struct ExtentAlloc {
    pub start_lbid: Lbid,
    /// Size of this extent in blocks.
    pub alloc_blocks: u64,
    pub dbroot: u16,
    pub partition: u32,
    pub segment: u16,
}

/// Table-lock lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLockState {
    Loading,
    Cleanup,
}

/// Identity of a lock holder, reported when acquisition is refused.
#[derive(Debug, Clone)]
pub struct LockOwner {
    pub name: String,
    pub pid: u32,
    pub session_id: i32,
    pub txn_id: i32,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "process-{}; pid-{}; session-{}; txn-{}",
            self.name, self.pid, self.session_id, self.txn_id
        )
    }
}

/// Client interface to the Block Resolution Manager.
pub trait BrmClient: Send + Sync {
    /// Allocate the next stripe for a table: one extent per `(oid, width)`
    /// entry, all on the same DBRoot/partition/segment.
    fn allocate_stripe(
        &self,
        table_oid: u32,
        cols: &[(u32, usize)],
        blocks_per_extent: &[u64],
    ) -> Result<Vec<ExtentAlloc>>;

    /// Allocate a run of store-file blocks for a dictionary column.
    fn allocate_dictionary_extent(&self, dict_oid: u32, blocks: u64) -> Result<Lbid>;

    /// Try to take the table lock.  `Ok(None)` means another owner holds it.
    fn get_table_lock(&self, table_oid: u32, owner: LockOwner) -> Result<Option<u64>>;

    /// Current holder of the table lock, if any.
    fn table_lock_owner(&self, table_oid: u32) -> Option<LockOwner>;

    /// Move a held lock to a new state; `Ok(false)` if the lock is gone.
    fn change_table_lock_state(&self, lock_id: u64, state: TableLockState) -> Result<bool>;

    /// Release a held lock; `Ok(false)` if the lock was not held.
    fn release_table_lock(&self, lock_id: u64) -> Result<bool>;

    /// Reserve `count` auto-increment values; returns the first reserved.
    fn reserve_auto_inc(&self, col_oid: u32, count: u64) -> Result<u64>;

    /// Next unreserved auto-increment value.
    fn auto_inc_next_value(&self, col_oid: u32) -> Result<u64>;

    /// Publish the auto-increment next-value to the system catalog.
    fn update_auto_inc_catalog(&self, col_oid: u32, next: u64) -> Result<()>;

    /// Publish a column's local HWM for one segment file.
    fn set_local_hwm(&self, col_oid: u32, partition: u32, segment: u16, hwm: u64) -> Result<()>;

    /// Publish an extent's min/max range (8-byte-or-narrower columns).
    fn set_extent_range(&self, start_lbid: Lbid, min: i64, max: i64) -> Result<()>;

    /// Publish an extent's min/max range (16-byte columns).
    fn set_extent_range_wide(&self, start_lbid: Lbid, min: i128, max: i128) -> Result<()>;

    /// DBRoot ids currently assigned to this node.
    fn root_id_list(&self) -> Vec<u16>;
}

// ============================================================================
// In-process BRM
// ============================================================================

#[derive(Debug)]
struct TableLock {
    id: u64,
    table_oid: u32,
    owner: LockOwner,
    state: TableLockState,
}

#[derive(Default)]
struct BrmState {
    next_lbid: Lbid,
    next_lock_id: u64,
    locks: Vec<TableLock>,
    sequences: HashMap<u32, u64>,
    hwms: HashMap<(u32, u32, u16), u64>,
    ranges: HashMap<Lbid, (i64, i64)>,
    wide_ranges: HashMap<Lbid, (i128, i128)>,
    catalog_next: HashMap<u32, u64>,
    stripes: HashMap<u32, u64>,
}

/// In-process Block Resolution Manager.
pub struct LocalBrm {
    dbroots: Vec<u16>,
    state: Mutex<BrmState>,
}

/// Segment files rotated through per partition before the partition advances.
const SEGMENTS_PER_PARTITION: u64 = 4;

impl LocalBrm {
    pub fn new(dbroots: Vec<u16>) -> Arc<Self> {
        assert!(!dbroots.is_empty());
        Arc::new(Self {
            dbroots,
            state: Mutex::new(BrmState {
                next_lbid: 1,
                next_lock_id: 1,
                ..Default::default()
            }),
        })
    }

    /// Published range for an extent, if any (test/inspection hook).
    pub fn extent_range(&self, start_lbid: Lbid) -> Option<(i64, i64)> {
        self.state.lock().ranges.get(&start_lbid).copied()
    }

    pub fn extent_range_wide(&self, start_lbid: Lbid) -> Option<(i128, i128)> {
        self.state.lock().wide_ranges.get(&start_lbid).copied()
    }

    pub fn local_hwm(&self, col_oid: u32, partition: u32, segment: u16) -> Option<u64> {
        self.state
            .lock()
            .hwms
            .get(&(col_oid, partition, segment))
            .copied()
    }

    pub fn catalog_auto_inc(&self, col_oid: u32) -> Option<u64> {
        self.state.lock().catalog_next.get(&col_oid).copied()
    }

    pub fn table_lock_state(&self, lock_id: u64) -> Option<TableLockState> {
        self.state
            .lock()
            .locks
            .iter()
            .find(|l| l.id == lock_id)
            .map(|l| l.state)
    }
}

impl BrmClient for LocalBrm {
    fn allocate_stripe(
        &self,
        table_oid: u32,
        cols: &[(u32, usize)],
        blocks_per_extent: &[u64],
    ) -> Result<Vec<ExtentAlloc>> {
        let mut state = self.state.lock();
        let stripe = *state
            .stripes
            .entry(table_oid)
            .and_modify(|s| *s += 1)
            .or_insert(0);

        let dbroot = self.dbroots[(stripe / SEGMENTS_PER_PARTITION) as usize % self.dbroots.len()];
        let segment = (stripe % SEGMENTS_PER_PARTITION) as u16;
        let partition = (stripe / (SEGMENTS_PER_PARTITION * self.dbroots.len() as u64)) as u32;

        let mut allocs = Vec::with_capacity(cols.len());
        for (i, _col) in cols.iter().enumerate() {
            let blocks = blocks_per_extent[i];
            let start_lbid = state.next_lbid;
            state.next_lbid += blocks;
            allocs.push(ExtentAlloc {
                start_lbid,
                alloc_blocks: blocks,
                dbroot,
                partition,
                segment,
            });
        }

        Ok(allocs)
    }

    fn allocate_dictionary_extent(&self, _dict_oid: u32, blocks: u64) -> Result<Lbid> {
        let mut state = self.state.lock();
        let start = state.next_lbid;
        state.next_lbid += blocks;
        Ok(start)
    }

    fn get_table_lock(&self, table_oid: u32, owner: LockOwner) -> Result<Option<u64>> {
        let mut state = self.state.lock();

        if state.locks.iter().any(|l| l.table_oid == table_oid) {
            return Ok(None);
        }

        let id = state.next_lock_id;
        state.next_lock_id += 1;
        state.locks.push(TableLock {
            id,
            table_oid,
            owner,
            state: TableLockState::Loading,
        });

        Ok(Some(id))
    }

    fn table_lock_owner(&self, table_oid: u32) -> Option<LockOwner> {
        self.state
            .lock()
            .locks
            .iter()
            .find(|l| l.table_oid == table_oid)
            .map(|l| l.owner.clone())
    }

    fn change_table_lock_state(&self, lock_id: u64, state: TableLockState) -> Result<bool> {
        let mut guard = self.state.lock();
        match guard.locks.iter_mut().find(|l| l.id == lock_id) {
            Some(lock) => {
                lock.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release_table_lock(&self, lock_id: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let before = state.locks.len();
        state.locks.retain(|l| l.id != lock_id);
        Ok(state.locks.len() != before)
    }

    fn reserve_auto_inc(&self, col_oid: u32, count: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let next = state.sequences.entry(col_oid).or_insert(1);
        let first = *next;
        *next = next
            .checked_add(count)
            .ok_or_else(|| BulkError::Brm("auto-increment sequence exhausted".to_string()))?;
        Ok(first)
    }

    fn auto_inc_next_value(&self, col_oid: u32) -> Result<u64> {
        Ok(*self.state.lock().sequences.entry(col_oid).or_insert(1))
    }

    fn update_auto_inc_catalog(&self, col_oid: u32, next: u64) -> Result<()> {
        self.state.lock().catalog_next.insert(col_oid, next);
        Ok(())
    }

    fn set_local_hwm(&self, col_oid: u32, partition: u32, segment: u16, hwm: u64) -> Result<()> {
        self.state
            .lock()
            .hwms
            .insert((col_oid, partition, segment), hwm);
        Ok(())
    }

    fn set_extent_range(&self, start_lbid: Lbid, min: i64, max: i64) -> Result<()> {
        self.state.lock().ranges.insert(start_lbid, (min, max));
        Ok(())
    }

    fn set_extent_range_wide(&self, start_lbid: Lbid, min: i128, max: i128) -> Result<()> {
        self.state.lock().wide_ranges.insert(start_lbid, (min, max));
        Ok(())
    }

    fn root_id_list(&self) -> Vec<u16> {
        self.dbroots.clone()
    }
}

// ============================================================================
// Stripe allocator
// ============================================================================

struct StripeState {
    cols: Vec<(u32, usize)>,
    blocks_per_extent: Vec<u64>,
    pending: HashMap<u32, VecDeque<ExtentAlloc>>,
}

/// Per-table extent allocator.  Calls the BRM once per stripe and hands each
/// column its share, so all columns advance through DBRoot/partition/segment
/// together.
pub struct ExtentStripeAllocator {
    table_oid: u32,
    brm: Arc<dyn BrmClient>,
    extent_rows: u64,
    block_size: usize,
    state: Mutex<StripeState>,
}

impl ExtentStripeAllocator {
    /// `extent_rows` is the row capacity of every column's extent; extents
    /// differ in bytes, not rows, so all columns cross extent boundaries at
    /// the same input row.
    pub fn new(table_oid: u32, brm: Arc<dyn BrmClient>, extent_rows: u64, block_size: usize) -> Self {
        Self {
            table_oid,
            brm,
            extent_rows,
            block_size,
            state: Mutex::new(StripeState {
                cols: Vec::new(),
                blocks_per_extent: Vec::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Rows held by one extent of any column of this table.
    pub fn rows_per_extent(&self, _width: usize) -> u64 {
        self.extent_rows
    }

    pub fn add_column(&self, oid: u32, width: usize) {
        let mut state = self.state.lock();
        state.cols.push((oid, width));
        // Every column's extent spans the same rows, so its block count
        // scales with width.
        let blocks = self.extent_rows * width as u64 / self.block_size as u64;
        state.blocks_per_extent.push(blocks.max(1));
        state.pending.insert(oid, VecDeque::new());
    }

    /// Next extent for the given column, allocating a new stripe on demand.
    pub fn allocate_extent(&self, col_oid: u32) -> Result<ExtentAlloc> {
        let mut state = self.state.lock();

        let queue = state
            .pending
            .get(&col_oid)
            .ok_or_else(|| BulkError::Brm(format!("unknown column OID {}", col_oid)))?;

        if queue.is_empty() {
            let allocs =
                self.brm
                    .allocate_stripe(self.table_oid, &state.cols, &state.blocks_per_extent)?;
            for ((oid, _w), alloc) in state.cols.clone().iter().zip(allocs) {
                state.pending.get_mut(oid).expect("registered column").push_back(alloc);
            }
        }

        state
            .pending
            .get_mut(&col_oid)
            .expect("registered column")
            .pop_front()
            .ok_or_else(|| BulkError::Brm(format!("no extent allocated for OID {}", col_oid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> LockOwner {
        LockOwner {
            name: name.to_string(),
            pid: 42,
            session_id: -1,
            txn_id: -1,
        }
    }

    #[test]
    fn test_table_lock_exclusive() {
        let brm = LocalBrm::new(vec![1]);

        let id = brm.get_table_lock(3000, owner("importA")).unwrap().unwrap();
        assert!(brm.get_table_lock(3000, owner("importB")).unwrap().is_none());
        assert_eq!(brm.table_lock_owner(3000).unwrap().name, "importA");

        assert!(brm.change_table_lock_state(id, TableLockState::Cleanup).unwrap());
        assert_eq!(brm.table_lock_state(id), Some(TableLockState::Cleanup));
        assert!(brm.release_table_lock(id).unwrap());
        // Releasing twice succeeds with released=false.
        assert!(!brm.release_table_lock(id).unwrap());

        // Lock is free again.
        assert!(brm.get_table_lock(3000, owner("importB")).unwrap().is_some());
    }

    #[test]
    fn test_auto_inc_reservation() {
        let brm = LocalBrm::new(vec![1]);

        assert_eq!(brm.reserve_auto_inc(7, 10).unwrap(), 1);
        assert_eq!(brm.reserve_auto_inc(7, 5).unwrap(), 11);
        assert_eq!(brm.auto_inc_next_value(7).unwrap(), 16);
    }

    #[test]
    fn test_stripe_shares_location() {
        let brm = LocalBrm::new(vec![1]);
        let alloc = ExtentStripeAllocator::new(3000, brm, 1024, 8192);
        alloc.add_column(101, 1);
        alloc.add_column(102, 8);

        let a = alloc.allocate_extent(101).unwrap();
        let b = alloc.allocate_extent(102).unwrap();
        assert_eq!((a.dbroot, a.partition, a.segment), (b.dbroot, b.partition, b.segment));
        assert_ne!(a.start_lbid, b.start_lbid);

        // Rows per extent are the same for every width; byte sizes differ.
        assert_eq!(alloc.rows_per_extent(1), 1024);
        assert_eq!(alloc.rows_per_extent(8), 1024);
        assert_eq!(a.alloc_blocks, 1); // 1024 bytes rounds up to one block
        assert_eq!(b.alloc_blocks, 1);
    }

    #[test]
    fn test_stripe_advances_segment() {
        let brm = LocalBrm::new(vec![1]);
        let alloc = ExtentStripeAllocator::new(3000, brm, 1024, 8192);
        alloc.add_column(101, 8);

        let first = alloc.allocate_extent(101).unwrap();
        let second = alloc.allocate_extent(101).unwrap();
        assert_eq!(first.segment, 0);
        assert_eq!(second.segment, 1);
        assert_eq!(first.partition, second.partition);
    }
}
