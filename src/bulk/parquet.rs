//! Parquet import source.
//!
//! One file at a time is opened as a RecordBatch iterator with a
//! configurable batch size.  Parquet batches bypass the row-buffer ring:
//! each column of each batch reserves sections straight from its column
//! buffer manager, converts in place, and releases.  The ordering contract
//! is the same as the ring path, without the ring.
//!
//! Auto-increment values for a batch's nulls are reserved from the BRM once
//! per batch, so concurrent or successive batches never hand out the same
//! number twice.

use std::fs::File;
use std::path::Path;

use arrow::array::{Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};

use crate::bulk::column_info::ColumnInfo;
use crate::bulk::convert::{self, BufferStats};
use crate::data::StorageKind;
use crate::{BulkError, Result};

/// An open Parquet file positioned for batch iteration.
pub struct ParquetSource {
    reader: ParquetRecordBatchReader,
    total_rows: i64,
}

impl ParquetSource {
    pub fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| BulkError::FileOpen(format!("{}: {}", path.display(), e)))?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| BulkError::Parquet(format!("{}: {}", path.display(), e)))?;
        let total_rows = builder.metadata().file_metadata().num_rows();

        let reader = builder
            .with_batch_size(batch_size)
            .build()
            .map_err(|e| BulkError::Parquet(format!("{}: {}", path.display(), e)))?;

        Ok(Self { reader, total_rows })
    }

    /// Row count declared in the file footer.
    pub fn total_rows(&self) -> i64 {
        self.total_rows
    }

    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match self.reader.next() {
            None => Ok(None),
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(BulkError::Parquet(e.to_string())),
        }
    }
}

/// Convert one batch column and scatter it through reserved sections.
pub fn parse_column_batch(ci: &ColumnInfo, array: &ArrayRef, start_row: u64) -> Result<()> {
    let n = array.len();
    let width = ci.column.width;

    let mut auto_inc = if ci.column.auto_increment {
        let nulls = array.null_count() as u64;
        if nulls > 0 {
            Some(ci.reserve_auto_inc(nulls)?)
        } else {
            None
        }
    } else {
        None
    };

    let mut offset = 0usize;
    while offset < n {
        let (mut section, last_row_in_extent) =
            ci.mgr().reserve(start_row + offset as u64, n - offset)?;
        let granted = section.row_count();

        let chunk = array.slice(offset, granted);
        let mut stats = BufferStats::new(&ci.column);
        let mut out = vec![0u8; granted * width];
        convert::convert_arrow_chunk(
            &ci.column,
            chunk.as_ref(),
            auto_inc.as_mut(),
            &mut stats,
            &mut out,
        )?;
        section.write(&out, granted);

        ci.update_cp(last_row_in_extent, &stats);
        ci.inc_saturated(stats.sat_count);
        ci.mgr().release(section)?;

        offset += granted;
    }

    Ok(())
}

/// Tokenize one batch column through the dictionary and persist the tokens.
pub fn parse_dict_batch(ci: &ColumnInfo, array: &ArrayRef, start_row: u64) -> Result<()> {
    debug_assert_eq!(ci.column.storage, StorageKind::Token);
    let n = array.len();
    let width = ci.column.width;

    let mut offset = 0usize;
    while offset < n {
        let (mut section, _) = ci.mgr().reserve(start_row + offset as u64, n - offset)?;
        let granted = section.row_count();

        let chunk = array.slice(offset, granted);
        let mut owned: Vec<Option<Vec<u8>>> = Vec::with_capacity(granted);
        for i in 0..granted {
            owned.push(convert::arrow_string_at(chunk.as_ref(), i)?);
        }
        let values: Vec<Option<&[u8]>> = owned.iter().map(|v| v.as_deref()).collect();

        let mut out = Vec::with_capacity(granted * width);
        ci.tokenize(&values, &mut out)?;
        section.write(&out, granted);
        ci.mgr().release(section)?;

        offset += granted;
    }

    Ok(())
}

/// Synthesize the implicit aux column for one batch's rows.
pub fn parse_aux_batch(ci: &ColumnInfo, rows: usize, start_row: u64) -> Result<()> {
    let width = ci.column.width;

    let mut offset = 0usize;
    while offset < rows {
        let (mut section, last_row_in_extent) =
            ci.mgr().reserve(start_row + offset as u64, rows - offset)?;
        let granted = section.row_count();

        let mut stats = BufferStats::new(&ci.column);
        let mut out = vec![0u8; granted * width];
        convert::convert_aux_rows(&ci.column, granted, &mut stats, &mut out);
        section.write(&out, granted);

        ci.update_cp(last_row_in_extent, &stats);
        ci.inc_saturated(stats.sat_count);
        ci.mgr().release(section)?;

        offset += granted;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brm::{BrmClient, ExtentStripeAllocator, LocalBrm};
    use crate::bulk::JobStatus;
    use crate::data::{JobColumn, LogicalKind};
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field as ArrowField, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_parquet(path: &Path, batch: RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn mk_columns(dir: &Path, cols: Vec<JobColumn>) -> Vec<Arc<ColumnInfo>> {
        let brm = LocalBrm::new(vec![1]);
        let alloc = Arc::new(ExtentStripeAllocator::new(
            3000,
            Arc::clone(&brm) as Arc<dyn BrmClient>,
            1024,
            8192,
        ));
        let status = Arc::new(JobStatus::new());
        cols.into_iter()
            .map(|c| {
                alloc.add_column(c.oid, c.width);
                Arc::new(
                    ColumnInfo::new(
                        c,
                        dir,
                        Arc::clone(&brm) as Arc<dyn BrmClient>,
                        Arc::clone(&alloc),
                        Arc::clone(&status),
                        8192,
                        4,
                    )
                    .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_batched_read_and_persist() {
        let dir = tempdir().unwrap();
        let pq = dir.path().join("in.parquet");

        let schema = Arc::new(Schema::new(vec![ArrowField::new(
            "v",
            DataType::Int32,
            true,
        )]));
        let values: Vec<Option<i32>> = (0..10).map(Some).collect();
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        write_parquet(&pq, batch);

        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new("v", 101, StorageKind::Int, LogicalKind::Int)],
        );

        let mut src = ParquetSource::open(&pq, 4).unwrap();
        assert_eq!(src.total_rows(), 10);

        let mut row = 0u64;
        while let Some(batch) = src.next_batch().unwrap() {
            // Batch size 4 splits 10 rows into 4+4+2.
            assert!(batch.num_rows() <= 4);
            parse_column_batch(&cols[0], batch.column(0), row).unwrap();
            row += batch.num_rows() as u64;
        }
        assert_eq!(row, 10);
        cols[0].finish_parsing().unwrap();

        let bytes = std::fs::read(&cols[0].mgr().file_paths()[0]).unwrap();
        let vals: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn test_dict_batch_tokens() {
        let dir = tempdir().unwrap();
        let pq = dir.path().join("in.parquet");

        let schema = Arc::new(Schema::new(vec![ArrowField::new(
            "s",
            DataType::Utf8,
            true,
        )]));
        let arr = StringArray::from(vec![Some("x"), None, Some("x")]);
        let batch = RecordBatch::try_new(schema, vec![Arc::new(arr)]).unwrap();
        write_parquet(&pq, batch);

        let cols = mk_columns(dir.path(), vec![JobColumn::new_dict("s", 101, 2001, 8)]);

        let mut src = ParquetSource::open(&pq, 1024).unwrap();
        let batch = src.next_batch().unwrap().unwrap();
        parse_dict_batch(&cols[0], batch.column(0), 0).unwrap();
        cols[0].finish_parsing().unwrap();

        let bytes = std::fs::read(&cols[0].mgr().file_paths()[0]).unwrap();
        let tokens: Vec<u64> = bytes
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(tokens[0], tokens[2]);
        assert_eq!(tokens[1], crate::data::nulls::DICT_NULL_TOKEN);
    }

    #[test]
    fn test_auto_inc_reserved_per_batch() {
        let dir = tempdir().unwrap();

        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new("id", 101, StorageKind::Int, LogicalKind::Int)
                .with_auto_increment()],
        );

        // Two batches with nulls each; reservations must not overlap.
        let a: ArrayRef = Arc::new(Int32Array::from(vec![None, None, Some(50)]));
        let b: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(60)]));
        parse_column_batch(&cols[0], &a, 0).unwrap();
        parse_column_batch(&cols[0], &b, 3).unwrap();
        cols[0].finish_parsing().unwrap();

        let bytes = std::fs::read(&cols[0].mgr().file_paths()[0]).unwrap();
        let vals: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![1, 2, 50, 3, 60]);
    }
}
