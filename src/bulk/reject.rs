//! Reject reporting: bad input rows and their error reasons.
//!
//! On the first rejected row the sink lazily creates
//! `<input>.Job_<jobId>_<pid>.bad` (the raw rows, as read) and a matching
//! `.err` file (`Line number N;  Error: reason` per row) in the configured
//! error directory, or next to the input file.  On close, both files are
//! flushed and their absolute paths recorded for the end-of-job report.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::Result;

const BAD_FILE_SUFFIX: &str = ".bad";
const ERR_FILE_SUFFIX: &str = ".err";

/// One rejected row: its 1-based line number, the reason, and the raw bytes.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
    pub raw: Vec<u8>,
}

/// Per-table reject sink.  Guarded by the controller's error-report mutex.
pub struct RejectSink {
    job_id: u32,
    error_dir: Option<PathBuf>,
    input_file: PathBuf,

    data_file: Option<BufWriter<File>>,
    data_path: PathBuf,
    err_file: Option<BufWriter<File>>,
    err_path: PathBuf,

    data_count: u64,
    err_count: u64,

    /// Absolute paths of every closed reject file, for the final report.
    pub bad_files: Vec<PathBuf>,
    pub err_files: Vec<PathBuf>,
}

impl RejectSink {
    pub fn new(job_id: u32, error_dir: Option<PathBuf>) -> Self {
        Self {
            job_id,
            error_dir,
            input_file: PathBuf::new(),
            data_file: None,
            data_path: PathBuf::new(),
            err_file: None,
            err_path: PathBuf::new(),
            data_count: 0,
            err_count: 0,
            bad_files: Vec::new(),
            err_files: Vec::new(),
        }
    }

    /// Point the sink at the input file currently being read.
    pub fn set_input_file(&mut self, input: &Path) {
        self.input_file = input.to_path_buf();
    }

    fn reject_path(&self, suffix: &str) -> PathBuf {
        let base_name = self
            .input_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stdin".to_string());

        let file_name = format!(
            "{}.Job_{}_{}{}",
            base_name,
            self.job_id,
            std::process::id(),
            suffix
        );

        match &self.error_dir {
            Some(dir) => dir.join(file_name),
            None => match self.input_file.parent() {
                Some(parent) if parent.as_os_str().len() > 0 => parent.join(file_name),
                _ => PathBuf::from(file_name),
            },
        }
    }

    /// Append a batch of rejected rows to the .bad/.err pair.
    pub fn write_rejects(&mut self, rows: &[RejectedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        if self.data_file.is_none() {
            self.data_path = self.reject_path(BAD_FILE_SUFFIX);
            self.data_file = Some(BufWriter::new(File::create(&self.data_path)?));
        }
        if self.err_file.is_none() {
            self.err_path = self.reject_path(ERR_FILE_SUFFIX);
            self.err_file = Some(BufWriter::new(File::create(&self.err_path)?));
        }

        let data = self.data_file.as_mut().expect("opened above");
        let err = self.err_file.as_mut().expect("opened above");

        for row in rows {
            data.write_all(&row.raw)?;
            if !row.raw.ends_with(b"\n") {
                data.write_all(b"\n")?;
            }
            writeln!(err, "Line number {};  Error: {}", row.line, row.reason)?;
        }

        self.data_count += rows.len() as u64;
        self.err_count += rows.len() as u64;

        Ok(())
    }

    /// Flush and close both files, recording their absolute paths.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut f) = self.data_file.take() {
            f.flush()?;
            if self.data_count > 0 {
                let abs = absolutize(&self.data_path);
                log::info!(
                    "Number of rows with bad data = {}.  Exact rows are listed in file located here: {}",
                    self.data_count,
                    abs.display()
                );
                self.bad_files.push(abs);
                self.data_count = 0;
            }
        }

        if let Some(mut f) = self.err_file.take() {
            f.flush()?;
            if self.err_count > 0 {
                self.err_files.push(absolutize(&self.err_path));
                self.err_count = 0;
            }
        }

        Ok(())
    }

    /// Whether any rows were ever rejected through this sink.
    pub fn any_rejects(&self) -> bool {
        self.data_count > 0 || !self.bad_files.is_empty()
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reject(line: u64, reason: &str, raw: &str) -> RejectedRow {
        RejectedRow {
            line,
            reason: reason.to_string(),
            raw: raw.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_lazy_creation() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("orders.tbl");
        std::fs::write(&input, "x\n").unwrap();

        let mut sink = RejectSink::new(7, None);
        sink.set_input_file(&input);

        // No files until the first reject.
        sink.close().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        sink.write_rejects(&[reject(3, "too many columns", "a,b,c,d\n")])
            .unwrap();
        sink.close().unwrap();

        assert_eq!(sink.bad_files.len(), 1);
        assert_eq!(sink.err_files.len(), 1);
        assert!(sink.bad_files[0].is_absolute());

        let bad = std::fs::read_to_string(&sink.bad_files[0]).unwrap();
        assert_eq!(bad, "a,b,c,d\n");

        let err = std::fs::read_to_string(&sink.err_files[0]).unwrap();
        assert_eq!(err, "Line number 3;  Error: too many columns\n");
    }

    #[test]
    fn test_error_dir_and_naming() {
        let dir = tempdir().unwrap();
        let errdir = dir.path().join("rejects");
        std::fs::create_dir(&errdir).unwrap();

        let mut sink = RejectSink::new(12, Some(errdir.clone()));
        sink.set_input_file(Path::new("/data/in/orders.tbl"));
        sink.write_rejects(&[reject(1, "bad", "z\n")]).unwrap();
        sink.close().unwrap();

        let name = sink.bad_files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("orders.tbl.Job_12_"));
        assert!(name.ends_with(".bad"));
        assert_eq!(sink.bad_files[0].parent().unwrap(), errdir);
    }
}
