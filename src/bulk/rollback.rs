//! Bulk rollback: pre-import snapshots and crash recovery.
//!
//! Before a job writes any user data it persists, per column, the starting
//! DBRoot/partition/segment/HWM, the dictionary store OID, and the exact
//! byte length of every segment file that already exists.  If the job dies,
//! the rollback manager truncates surviving files back to their snapshot
//! lengths and deletes every file the job created, restoring the pre-import
//! byte image.
//!
//! Record format on disk: length-prefixed bincode followed by a crc32
//! trailer; a checksum mismatch means the meta file itself is unusable and
//! the rollback is refused.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::DbRootExtentInfo;
use crate::{BulkError, Result};

const META_SUFFIX: &str = ".rbmeta";

/// Snapshot of one already-existing file at job start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub len: u64,
}

/// Pre-import state of one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub oid: u32,
    pub width: usize,
    pub dictionary_oid: Option<u32>,
    pub start: DbRootExtentInfo,
    pub files: Vec<FileSnapshot>,
}

/// Everything needed to undo one table's import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackMeta {
    pub table_oid: u32,
    pub table_name: String,
    pub process_name: String,
    pub pid: u32,
    pub dbroots: Vec<u16>,
    pub columns: Vec<ColumnSnapshot>,
}

/// Writes and deletes a table's rollback metadata file.
pub struct RollbackMetaWriter {
    process_name: String,
    meta_path: Option<PathBuf>,
}

impl RollbackMetaWriter {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            meta_path: None,
        }
    }

    /// Create the (initially empty) metadata file for a table.
    pub fn init(&mut self, table_oid: u32, meta_dir: &Path) -> Result<()> {
        fs::create_dir_all(meta_dir)?;
        let path = meta_dir.join(format!("{}{}", table_oid, META_SUFFIX));
        File::create(&path)?;
        self.meta_path = Some(path);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.meta_path.as_deref()
    }

    /// Persist the snapshot.  Must complete before any user data is written.
    pub fn save(&self, meta: &RollbackMeta) -> Result<()> {
        let path = self.meta_path.as_ref().ok_or_else(|| {
            BulkError::Rollback("rollback metadata file was never initialized".to_string())
        })?;

        debug_assert_eq!(meta.process_name, self.process_name);

        let payload = bincode::serialize(meta)
            .map_err(|e| BulkError::Rollback(format!("encode rollback meta: {}", e)))?;
        let crc = crc32fast::hash(&payload);

        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    /// Remove the metadata file.  Failures here are advisory to the caller.
    pub fn delete(&self) -> Result<()> {
        if let Some(path) = &self.meta_path {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Load and verify a rollback metadata file.
pub fn read_meta(path: &Path) -> Result<RollbackMeta> {
    let mut file = File::open(path)?;

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)
        .map_err(|_| BulkError::Rollback("rollback meta file is empty".to_string()))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;

    let mut crc_bytes = [0u8; 4];
    file.read_exact(&mut crc_bytes)?;
    if crc32fast::hash(&payload) != u32::from_le_bytes(crc_bytes) {
        return Err(BulkError::Rollback(
            "rollback meta checksum mismatch".to_string(),
        ));
    }

    bincode::deserialize(&payload)
        .map_err(|e| BulkError::Rollback(format!("decode rollback meta: {}", e)))
}

/// Restores every touched segment and store file from a rollback snapshot.
pub struct BulkRollbackManager {
    table_name: String,
}

impl BulkRollbackManager {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
        }
    }

    /// Roll the data directory back to the snapshot: truncate listed files
    /// to their recorded lengths, delete files the job created, and remove
    /// the metadata file unless asked to keep it.
    pub fn rollback(&self, meta_path: &Path, base_dir: &Path, keep_meta: bool) -> Result<()> {
        let meta = read_meta(meta_path)?;

        for col in &meta.columns {
            let mut keep: Vec<&FileSnapshot> = col.files.iter().collect();

            for entry in fs::read_dir(base_dir)? {
                let entry = entry?;
                let path = entry.path();
                if !is_column_file(&path, col.oid, col.dictionary_oid) {
                    continue;
                }

                match keep.iter().position(|f| f.path == path) {
                    Some(idx) => {
                        let snap = keep.remove(idx);
                        let len = fs::metadata(&path)?.len();
                        if len > snap.len {
                            log::info!(
                                "Rolling back {} to {} bytes for table {}",
                                path.display(),
                                snap.len,
                                self.table_name
                            );
                            OpenOptions::new()
                                .write(true)
                                .open(&path)?
                                .set_len(snap.len)?;
                        }
                    }
                    None => {
                        log::info!(
                            "Removing segment file {} created by failed import of table {}",
                            path.display(),
                            self.table_name
                        );
                        fs::remove_file(&path)?;
                    }
                }
            }
        }

        if !keep_meta {
            fs::remove_file(meta_path)?;
        }

        Ok(())
    }
}

/// Scan a column's on-disk files and snapshot their current lengths.
pub fn snapshot_column_files(
    base_dir: &Path,
    oid: u32,
    dictionary_oid: Option<u32>,
) -> Result<Vec<FileSnapshot>> {
    let mut files = Vec::new();

    if base_dir.exists() {
        for entry in fs::read_dir(base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_column_file(&path, oid, dictionary_oid) {
                let len = fs::metadata(&path)?.len();
                files.push(FileSnapshot { path, len });
            }
        }
    }

    Ok(files)
}

fn is_column_file(path: &Path, oid: u32, dictionary_oid: Option<u32>) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    if name.starts_with(&format!("FILE{:06}.", oid)) && name.ends_with(".cdf") {
        return true;
    }
    if let Some(dict) = dictionary_oid {
        if name == format!("FILE{:06}.dst", dict) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mk_meta(columns: Vec<ColumnSnapshot>) -> RollbackMeta {
        RollbackMeta {
            table_oid: 3000,
            table_name: "test.t1".to_string(),
            process_name: "importer".to_string(),
            pid: std::process::id(),
            dbroots: vec![1],
            columns,
        }
    }

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempdir().unwrap();
        let mut writer = RollbackMetaWriter::new("importer");
        writer.init(3000, dir.path()).unwrap();

        let meta = mk_meta(vec![ColumnSnapshot {
            oid: 101,
            width: 4,
            dictionary_oid: Some(2001),
            start: DbRootExtentInfo {
                dbroot: 1,
                partition: 0,
                segment: 0,
                local_hwm: 7,
            },
            files: vec![],
        }]);
        writer.save(&meta).unwrap();

        let loaded = read_meta(writer.path().unwrap()).unwrap();
        assert_eq!(loaded.table_oid, 3000);
        assert_eq!(loaded.columns.len(), 1);
        assert_eq!(loaded.columns[0].start.local_hwm, 7);
    }

    #[test]
    fn test_corrupt_meta_refused() {
        let dir = tempdir().unwrap();
        let mut writer = RollbackMetaWriter::new("importer");
        writer.init(3000, dir.path()).unwrap();
        writer.save(&mk_meta(vec![])).unwrap();

        let path = writer.path().unwrap().to_path_buf();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(read_meta(&path).is_err());
    }

    #[test]
    fn test_rollback_restores_byte_image() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir(&data_dir).unwrap();

        // Pre-existing segment file with 16 bytes of committed data.
        let existing = data_dir.join("FILE000101.1.0.0.cdf");
        fs::write(&existing, vec![7u8; 16]).unwrap();

        let mut writer = RollbackMetaWriter::new("importer");
        writer.init(3000, dir.path().join("meta").as_path()).unwrap();
        let meta = mk_meta(vec![ColumnSnapshot {
            oid: 101,
            width: 4,
            dictionary_oid: None,
            start: DbRootExtentInfo::default(),
            files: snapshot_column_files(&data_dir, 101, None).unwrap(),
        }]);
        writer.save(&meta).unwrap();

        // The "job" appends to the existing file and creates a new one.
        OpenOptions::new()
            .append(true)
            .open(&existing)
            .unwrap()
            .write_all(&vec![9u8; 24])
            .unwrap();
        fs::write(data_dir.join("FILE000101.1.0.1.cdf"), vec![9u8; 8]).unwrap();

        let mgr = BulkRollbackManager::new("test.t1");
        mgr.rollback(writer.path().unwrap(), &data_dir, false).unwrap();

        assert_eq!(fs::read(&existing).unwrap(), vec![7u8; 16]);
        assert!(!data_dir.join("FILE000101.1.0.1.cdf").exists());
        assert!(!writer.path().unwrap().exists());
    }

    #[test]
    fn test_rollback_ignores_other_columns() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir(&data_dir).unwrap();

        let other = data_dir.join("FILE000202.1.0.0.cdf");
        fs::write(&other, vec![1u8; 4]).unwrap();

        let mut writer = RollbackMetaWriter::new("importer");
        writer.init(3000, dir.path().join("meta").as_path()).unwrap();
        writer
            .save(&mk_meta(vec![ColumnSnapshot {
                oid: 101,
                width: 4,
                dictionary_oid: None,
                start: DbRootExtentInfo::default(),
                files: vec![],
            }]))
            .unwrap();

        let mgr = BulkRollbackManager::new("test.t1");
        mgr.rollback(writer.path().unwrap(), &data_dir, true).unwrap();

        assert!(other.exists());
        assert!(writer.path().unwrap().exists());
    }
}
