//! Dictionary store writer for token columns.
//!
//! Variable-length strings live in a paired store file; the column's segment
//! file holds fixed 8-byte tokens pointing back at them.  A token packs the
//! store-file block number with the value's ordinal inside that block.
//! Equal strings within one store extent share a token; the dedup map resets
//! at every extent boundary.  Null input maps to the fixed null token.
//!
//! Every store block that receives data is remembered as a logical block id
//! so the caller can invalidate stale copies in the upstream block cache
//! once the import commits.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;

use crate::brm::{BrmClient, Lbid};
use crate::data::nulls::DICT_NULL_TOKEN;
use crate::{BulkError, Result};

/// Store entry header: value byte length.
const ENTRY_HEADER: usize = 2;

struct DictExtent {
    start_lbid: Lbid,
    start_block: u64,
}

/// Append-only writer for one dictionary column's store file.
pub struct DictionaryWriter {
    oid: u32,
    path: PathBuf,
    file: BufWriter<File>,
    block_size: usize,
    blocks_per_extent: u64,

    brm: Arc<dyn BrmClient>,
    extents: Vec<DictExtent>,

    /// Global block index within the store file.
    cur_block: u64,
    /// Bytes used in the current block.
    cur_block_used: usize,
    /// Ordinal of the next value placed in the current block.
    cur_ordinal: u16,

    dedup: AHashMap<Vec<u8>, u64>,
    flush_blocks: Vec<Lbid>,
}

impl DictionaryWriter {
    pub fn open(
        oid: u32,
        base_dir: &Path,
        brm: Arc<dyn BrmClient>,
        block_size: usize,
        blocks_per_extent: u64,
    ) -> Result<Self> {
        let path = store_file_path(base_dir, oid);
        let file = BufWriter::with_capacity(
            256 * 1024,
            OpenOptions::new().create(true).append(true).open(&path)?,
        );

        Ok(Self {
            oid,
            path,
            file,
            block_size,
            blocks_per_extent,
            brm,
            extents: Vec::new(),
            cur_block: 0,
            cur_block_used: 0,
            cur_ordinal: 0,
            dedup: AHashMap::new(),
            flush_blocks: Vec::new(),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.path
    }

    /// Token for one input value; `None` is the null string.
    pub fn token_for(&mut self, value: Option<&[u8]>) -> Result<u64> {
        let bytes = match value {
            None => return Ok(DICT_NULL_TOKEN),
            Some(b) => b,
        };

        if ENTRY_HEADER + bytes.len() > self.block_size {
            return Err(BulkError::Brm(format!(
                "dictionary value of {} bytes exceeds store block capacity",
                bytes.len()
            )));
        }

        if let Some(&token) = self.dedup.get(bytes) {
            return Ok(token);
        }

        self.ensure_capacity(ENTRY_HEADER + bytes.len())?;

        let token = (self.cur_block << 16) | self.cur_ordinal as u64;

        self.file.write_all(&(bytes.len() as u16).to_le_bytes())?;
        self.file.write_all(bytes)?;
        self.record_flush_block();

        self.cur_block_used += ENTRY_HEADER + bytes.len();
        self.cur_ordinal += 1;
        self.dedup.insert(bytes.to_vec(), token);

        Ok(token)
    }

    /// Pad out the current block, flush, and sync the store file.
    pub fn finish(&mut self) -> Result<()> {
        self.pad_current_block()?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Block index of the last written store block.
    pub fn local_hwm(&self) -> u64 {
        self.cur_block
    }

    /// Drain the logical block ids written since the last drain.
    pub fn drain_flush_blocks(&mut self) -> Vec<Lbid> {
        std::mem::take(&mut self.flush_blocks)
    }

    fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        // First write ever allocates the first extent.
        if self.extents.is_empty() {
            self.allocate_extent()?;
        }

        if self.cur_block_used + needed > self.block_size {
            self.pad_current_block()?;
            self.cur_block += 1;
            self.cur_block_used = 0;
            self.cur_ordinal = 0;

            let extent = self.extents.last().expect("allocated above");
            if self.cur_block - extent.start_block >= self.blocks_per_extent {
                self.allocate_extent()?;
            }
        }

        Ok(())
    }

    fn allocate_extent(&mut self) -> Result<()> {
        let start_lbid = self
            .brm
            .allocate_dictionary_extent(self.oid, self.blocks_per_extent)?;
        self.extents.push(DictExtent {
            start_lbid,
            start_block: self.cur_block,
        });
        // Token reuse is scoped to one store extent.
        self.dedup.clear();
        Ok(())
    }

    fn pad_current_block(&mut self) -> Result<()> {
        if self.cur_block_used > 0 && self.cur_block_used < self.block_size {
            let pad = vec![0u8; self.block_size - self.cur_block_used];
            self.file.write_all(&pad)?;
            self.cur_block_used = self.block_size;
        }
        Ok(())
    }

    fn record_flush_block(&mut self) {
        let extent = self.extents.last().expect("extent allocated before write");
        let lbid = extent.start_lbid + (self.cur_block - extent.start_block);
        if self.flush_blocks.last() != Some(&lbid) {
            self.flush_blocks.push(lbid);
        }
    }
}

/// Canonical store-file path for a dictionary column.
pub fn store_file_path(base_dir: &Path, dict_oid: u32) -> PathBuf {
    base_dir.join(format!("FILE{:06}.dst", dict_oid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brm::LocalBrm;
    use tempfile::tempdir;

    fn mk_writer(dir: &Path, block_size: usize, blocks_per_extent: u64) -> DictionaryWriter {
        let brm = LocalBrm::new(vec![1]);
        DictionaryWriter::open(2001, dir, brm, block_size, blocks_per_extent).unwrap()
    }

    #[test]
    fn test_equal_strings_share_token() {
        let dir = tempdir().unwrap();
        let mut w = mk_writer(dir.path(), 8192, 16);

        let a = w.token_for(Some(b"hello")).unwrap();
        let b = w.token_for(Some(b"world")).unwrap();
        let c = w.token_for(Some(b"hello")).unwrap();

        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_null_token() {
        let dir = tempdir().unwrap();
        let mut w = mk_writer(dir.path(), 8192, 16);
        assert_eq!(w.token_for(None).unwrap(), DICT_NULL_TOKEN);
    }

    #[test]
    fn test_block_rollover() {
        let dir = tempdir().unwrap();
        // Block fits 3 entries of 30 bytes (2+28).
        let mut w = mk_writer(dir.path(), 96, 16);

        let mut tokens = Vec::new();
        for i in 0..4 {
            let v = format!("value-{:022}", i);
            tokens.push(w.token_for(Some(v.as_bytes())).unwrap());
        }

        // Fourth entry lands in block 1, ordinal 0.
        assert_eq!(tokens[3] >> 16, 1);
        assert_eq!(tokens[3] & 0xFFFF, 0);
        assert_eq!(w.local_hwm(), 1);

        w.finish().unwrap();
        let len = std::fs::metadata(w.store_path()).unwrap().len();
        // Two blocks on disk, both padded to the block size.
        assert_eq!(len, 2 * 96);
    }

    #[test]
    fn test_dedup_resets_per_extent() {
        let dir = tempdir().unwrap();
        // One block per extent; each block fits one 40-byte entry.
        let mut w = mk_writer(dir.path(), 48, 1);

        let a = w.token_for(Some(b"this-string-is-exactly-40-bytes-long-xx!")).unwrap();
        // Forces a new block, hence a new extent, hence a cleared dedup map.
        let b = w.token_for(Some(b"another-forty-byte-string-for-the-test!!")).unwrap();
        let c = w.token_for(Some(b"this-string-is-exactly-40-bytes-long-xx!")).unwrap();

        assert_ne!(a, b);
        // Same bytes, new extent: a fresh token, not the old one.
        assert_ne!(a, c);
    }

    #[test]
    fn test_flush_blocks_drained() {
        let dir = tempdir().unwrap();
        let mut w = mk_writer(dir.path(), 8192, 16);

        w.token_for(Some(b"x")).unwrap();
        w.token_for(Some(b"y")).unwrap();

        let blocks = w.drain_flush_blocks();
        assert_eq!(blocks.len(), 1);
        assert!(w.drain_flush_blocks().is_empty());
    }
}
