//! Configuration file resolution and lookup.
//!
//! One INI-style file, `storagemanager.cnf`, searched in the current
//! directory, then `$COLUMNSTORE_INSTALL_DIR`, then `/etc`; the first hit
//! wins and a missing file is a startup error.  Values are plain strings
//! addressed by `(section, key)`.  The parsed config is an owned value
//! passed by reference into the import pipeline; there is no lazy global.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{BulkError, Result};

/// Config file name searched for on startup.
pub const CONFIG_FILE_NAME: &str = "storagemanager.cnf";

/// Parsed configuration contents.
#[derive(Debug, Clone)]
pub struct Config {
    filename: PathBuf,
    contents: HashMap<String, String>, // "section.key" -> value
}

impl Config {
    /// Locate and parse the config file from the standard search path.
    pub fn open() -> Result<Self> {
        let mut paths: Vec<PathBuf> = vec![PathBuf::from(".")];

        if let Ok(install_dir) = std::env::var("COLUMNSTORE_INSTALL_DIR") {
            paths.push(PathBuf::from(install_dir));
        }

        paths.push(PathBuf::from("/etc"));

        for dir in &paths {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }

        Err(BulkError::Config(format!(
            "could not find {} in the search path",
            CONFIG_FILE_NAME
        )))
    }

    /// Parse a specific config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BulkError::Config(format!("{}: {}", path.display(), e)))?;
        let contents = Self::parse(&text)?;
        log::debug!("Loaded config from {}", path.display());

        Ok(Self {
            filename: path.to_path_buf(),
            contents,
        })
    }

    /// Build a config from literal INI text (used by embedding callers).
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(Self {
            filename: PathBuf::new(),
            contents: Self::parse(text)?,
        })
    }

    fn parse(text: &str) -> Result<HashMap<String, String>> {
        let mut contents = HashMap::new();
        let mut section = String::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    BulkError::Config(format!("line {}: unterminated section header", lineno + 1))
                })?;
                section = name.trim().to_string();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                BulkError::Config(format!("line {}: expected key = value", lineno + 1))
            })?;
            contents.insert(
                format!("{}.{}", section, key.trim()),
                value.trim().to_string(),
            );
        }

        Ok(contents)
    }

    /// Path of the file this config was loaded from.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// String lookup by section and key.
    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.contents
            .get(&format!("{}.{}", section, key))
            .map(|s| s.as_str())
    }

    fn get_parsed<T: std::str::FromStr>(&self, section: &str, key: &str, default: T) -> T {
        self.get_value(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// On-disk block size in bytes.
    pub fn block_size(&self) -> usize {
        self.get_parsed("WriteEngine", "BlockSize", 8192)
    }

    /// Rows per extent, identical for every column of a table.
    pub fn extent_rows(&self) -> u64 {
        self.get_parsed("WriteEngine", "ExtentRows", 8 * 1024 * 1024)
    }

    /// Number of row buffers in the reader/parser ring.
    pub fn read_buffer_count(&self) -> usize {
        self.get_parsed("WriteEngine", "ReadBufferCount", 5).max(2)
    }

    /// Target bytes per ring-buffer fill.
    pub fn read_buffer_size(&self) -> usize {
        self.get_parsed("WriteEngine", "ReadBufferSize", 1024 * 1024)
    }

    /// RecordBatch size for Parquet imports.
    pub fn parquet_batch_size(&self) -> usize {
        self.get_parsed("WriteEngine", "ParquetBatchSize", 64 * 1024)
    }

    /// Seconds to keep retrying table-lock acquisition.
    pub fn wait_period(&self) -> u64 {
        self.get_parsed("SystemConfig", "WaitPeriod", 10)
    }

    /// Module id appended to the lock-owner name ("pmN").
    pub fn local_module_id(&self) -> u32 {
        self.get_parsed("SystemConfig", "LocalModuleID", 1)
    }

    /// Directory for reject (.bad/.err) files; defaults to the input's dir.
    pub fn error_dir(&self) -> Option<PathBuf> {
        self.get_value("BulkLoad", "ErrorDir").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_and_lookup() {
        let cfg = Config::from_text(
            "# comment\n\
             [WriteEngine]\n\
             BlockSize = 4096\n\
             ExtentRows = 1024\n\
             \n\
             [SystemConfig]\n\
             WaitPeriod = 3\n",
        )
        .unwrap();

        assert_eq!(cfg.get_value("WriteEngine", "BlockSize"), Some("4096"));
        assert_eq!(cfg.block_size(), 4096);
        assert_eq!(cfg.extent_rows(), 1024);
        assert_eq!(cfg.wait_period(), 3);
        // Missing keys fall back to defaults.
        assert_eq!(cfg.read_buffer_count(), 5);
        assert!(cfg.error_dir().is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[BulkLoad]\nErrorDir = /tmp/rejects").unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.error_dir(), Some(PathBuf::from("/tmp/rejects")));
        assert_eq!(cfg.filename(), path.as_path());
    }

    #[test]
    fn test_bad_section_header() {
        assert!(Config::from_text("[WriteEngine\nBlockSize = 1").is_err());
    }

    #[test]
    fn test_ring_size_floor() {
        let cfg = Config::from_text("[WriteEngine]\nReadBufferCount = 1\n").unwrap();
        assert_eq!(cfg.read_buffer_count(), 2);
    }
}
