//! One slot of the reader/parser ring.
//!
//! The reader thread fills a buffer with pre-split, pre-validated rows;
//! parser workers then drain it one column at a time, each converting its
//! column's fields through a reserved section of the column buffer.  Rows
//! that fail structural or per-field validation never enter the buffer:
//! they are returned to the reader for the reject sink, and the surviving
//! rows keep a dense, gap-free global row numbering.
//!
//! Buffer and per-column cell status live in the table controller, guarded
//! by the table mutex; this type only owns the row payload.

use std::io::BufRead;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bulk::column_info::ColumnInfo;
use crate::bulk::convert::{self, BufferStats, Field};
use crate::bulk::reject::RejectedRow;
use crate::data::StorageKind;
use crate::Result;

/// Text tokenizer settings for one import.
#[derive(Debug, Clone)]
pub struct TextSettings {
    pub delimiter: u8,
    pub enclosed_by: Option<u8>,
    pub escape: u8,
    /// When set, the bare literal `NULL` also reads as null.
    pub null_string_mode: bool,
    /// Reject over-length strings instead of truncating them.
    pub truncation_as_error: bool,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            delimiter: b'|',
            enclosed_by: None,
            escape: b'\\',
            null_string_mode: false,
            truncation_as_error: false,
        }
    }
}

/// Outcome of one buffer fill.
#[derive(Debug)]
pub struct FillResult {
    pub eof: bool,
    /// Input rows consumed, valid and rejected alike.
    pub rows_read: u64,
    pub rejects: Vec<RejectedRow>,
}

#[derive(Default)]
struct BufferRows {
    /// Global index (across all input files) of the first valid row held.
    start_row: u64,
    rows: Vec<Vec<Field>>,
}

/// Row payload of one ring slot.
pub struct RowBuffer {
    id: usize,
    data: RwLock<BufferRows>,
}

impl RowBuffer {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            data: RwLock::new(BufferRows::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn row_count(&self) -> usize {
        self.data.read().rows.len()
    }

    /// Release the row payload once every column has parsed the buffer.
    pub fn clear(&self) {
        let mut data = self.data.write();
        data.rows.clear();
        data.rows.shrink_to_fit();
    }

    // ========== Fill (reader thread) ==========

    /// Fill from delimited text.  Reads whole lines until `max_bytes` is
    /// reached or the source ends; stops early once the rejected-row count
    /// exceeds `allowed_errs`.
    pub fn fill_from_text(
        &self,
        input: &mut dyn BufRead,
        columns: &[Arc<ColumnInfo>],
        settings: &TextSettings,
        start_row: u64,
        start_line: u64,
        max_bytes: usize,
        allowed_errs: u64,
    ) -> Result<FillResult> {
        let expected = columns.iter().filter(|c| !c.column.is_aux).count();
        let mut rows: Vec<Vec<Field>> = Vec::new();
        let mut rejects: Vec<RejectedRow> = Vec::new();
        let mut line = start_line;
        let mut bytes = 0usize;
        let mut eof = false;

        while bytes < max_bytes {
            let mut raw = Vec::new();
            let n = input.read_until(b'\n', &mut raw)?;
            if n == 0 {
                eof = true;
                break;
            }

            line += 1;
            bytes += n;

            let mut stripped: &[u8] = &raw;
            if stripped.ends_with(b"\n") {
                stripped = &stripped[..stripped.len() - 1];
            }
            if stripped.ends_with(b"\r") {
                stripped = &stripped[..stripped.len() - 1];
            }
            if stripped.is_empty() {
                continue;
            }

            let fields = split_fields(stripped, settings);

            if fields.len() != expected {
                rejects.push(RejectedRow {
                    line,
                    reason: format!(
                        "Column count mismatch; expected {}, found {}",
                        expected,
                        fields.len()
                    ),
                    raw,
                });
            } else if let Some(reason) = validate_row(columns, &fields, settings) {
                rejects.push(RejectedRow { line, reason, raw });
            } else {
                rows.push(fields);
            }

            if rejects.len() as u64 > allowed_errs {
                break;
            }
        }

        let rows_read = line - start_line;
        let mut data = self.data.write();
        data.start_row = start_row;
        data.rows = rows;

        Ok(FillResult {
            eof,
            rows_read,
            rejects,
        })
    }

    /// Fill from fixed-length binary records.
    pub fn fill_from_binary(
        &self,
        input: &mut dyn BufRead,
        columns: &[Arc<ColumnInfo>],
        rec_len: usize,
        start_row: u64,
        start_rec: u64,
        max_bytes: usize,
        allowed_errs: u64,
    ) -> Result<FillResult> {
        let widths: Vec<usize> = columns
            .iter()
            .filter(|c| !c.column.is_aux)
            .map(|c| c.column.width)
            .collect();

        let mut rows: Vec<Vec<Field>> = Vec::new();
        let mut rejects: Vec<RejectedRow> = Vec::new();
        let mut rec = start_rec;
        let mut bytes = 0usize;
        let mut eof = false;
        let mut record = vec![0u8; rec_len];

        while bytes < max_bytes {
            match read_full(input, &mut record)? {
                0 => {
                    eof = true;
                    break;
                }
                n if n < rec_len => {
                    rec += 1;
                    rejects.push(RejectedRow {
                        line: rec,
                        reason: format!("Incomplete record; read {} of {} bytes", n, rec_len),
                        raw: record[..n].to_vec(),
                    });
                    eof = true;
                    break;
                }
                _ => {}
            }

            rec += 1;
            bytes += rec_len;

            let mut fields = Vec::with_capacity(widths.len());
            let mut off = 0usize;
            for w in &widths {
                fields.push(Field::Bytes(record[off..off + w].to_vec()));
                off += w;
            }
            rows.push(fields);

            if rejects.len() as u64 > allowed_errs {
                break;
            }
        }

        let rows_read = rec - start_rec;
        let mut data = self.data.write();
        data.start_row = start_row;
        data.rows = rows;

        Ok(FillResult {
            eof,
            rows_read,
            rejects,
        })
    }

    // ========== Parse (worker threads) ==========

    /// Parse one column of this buffer: convert its fields and scatter them
    /// through reserved sections of the column's buffer manager.  A section
    /// never crosses an extent boundary, so the range accumulator is merged
    /// per section and a boundary crossing starts a fresh one.
    pub fn parse(&self, ci: &ColumnInfo, field_index: Option<usize>) -> Result<()> {
        let data = self.data.read();
        let n = data.rows.len();
        if n == 0 {
            return Ok(());
        }

        let width = ci.column.width;
        let mut offset = 0usize;

        while offset < n {
            let start = data.start_row + offset as u64;
            let (mut section, last_row_in_extent) = ci.mgr().reserve(start, n - offset)?;
            let granted = section.row_count();
            let chunk = &data.rows[offset..offset + granted];
            let mut stats = BufferStats::new(&ci.column);

            match (ci.column.storage, field_index) {
                (StorageKind::Token, Some(k)) => {
                    let values: Vec<Option<&[u8]>> = chunk
                        .iter()
                        .map(|row| match &row[k] {
                            Field::Null => None,
                            Field::Text(s) => Some(s.as_bytes()),
                            Field::Bytes(b) => Some(b.as_slice()),
                        })
                        .collect();

                    let mut out = Vec::with_capacity(granted * width);
                    ci.tokenize(&values, &mut out)?;
                    section.write(&out, granted);
                }
                (_, Some(k)) => {
                    let fields: Vec<&Field> = chunk.iter().map(|row| &row[k]).collect();

                    let mut auto_inc = if ci.column.auto_increment {
                        let nulls =
                            fields.iter().filter(|f| matches!(f, Field::Null)).count() as u64;
                        if nulls > 0 {
                            Some(ci.reserve_auto_inc(nulls)?)
                        } else {
                            None
                        }
                    } else {
                        None
                    };

                    let mut out = vec![0u8; granted * width];
                    convert::convert_field_rows(
                        &ci.column,
                        &fields,
                        auto_inc.as_mut(),
                        &mut stats,
                        &mut out,
                    )?;
                    section.write(&out, granted);
                }
                // The aux column has no input field; synthesize defaults.
                (_, None) => {
                    let mut out = vec![0u8; granted * width];
                    convert::convert_aux_rows(&ci.column, granted, &mut stats, &mut out);
                    section.write(&out, granted);
                }
            }

            if ci.column.storage != StorageKind::Token {
                ci.update_cp(last_row_in_extent, &stats);
            }
            ci.inc_saturated(stats.sat_count);
            ci.mgr().release(section)?;

            offset += granted;
        }

        Ok(())
    }
}

// ============================================================================
// Text tokenization
// ============================================================================

/// Split one line into fields under delimiter/enclosure/escape rules.
///
/// An unenclosed `\N` (escape char + N) is the null marker; with
/// `null_string_mode`, so is the bare literal `NULL`.  Empty unenclosed
/// fields read as null.  Enclosed fields are always literal values.
fn split_fields(line: &[u8], settings: &TextSettings) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut i = 0usize;
    let len = line.len();

    loop {
        let mut value = Vec::new();
        let mut enclosed = false;
        let mut escaped_any = false;

        if let Some(enc) = settings.enclosed_by {
            if i < len && line[i] == enc {
                enclosed = true;
                i += 1;
                while i < len {
                    let b = line[i];
                    if b == settings.escape && i + 1 < len {
                        value.push(line[i + 1]);
                        i += 2;
                    } else if b == enc {
                        i += 1;
                        break;
                    } else {
                        value.push(b);
                        i += 1;
                    }
                }
                // Skip to the delimiter after the closing enclosure.
                while i < len && line[i] != settings.delimiter {
                    i += 1;
                }
            }
        }

        if !enclosed {
            while i < len && line[i] != settings.delimiter {
                let b = line[i];
                if b == settings.escape && i + 1 < len && line[i + 1] != b'N' {
                    value.push(line[i + 1]);
                    escaped_any = true;
                    i += 2;
                } else {
                    value.push(b);
                    i += 1;
                }
            }
        }

        let field = if enclosed {
            Field::Text(String::from_utf8_lossy(&value).into_owned())
        } else if value.is_empty() {
            Field::Null
        } else if value == [settings.escape, b'N'] {
            Field::Null
        } else if !escaped_any && settings.null_string_mode && value == b"NULL" {
            Field::Null
        } else {
            Field::Text(String::from_utf8_lossy(&value).into_owned())
        };
        fields.push(field);

        if i >= len {
            break;
        }
        i += 1; // consume the delimiter

        if i == len {
            // Trailing delimiter: one final empty field.
            fields.push(Field::Null);
            break;
        }
    }

    fields
}

fn validate_row(
    columns: &[Arc<ColumnInfo>],
    fields: &[Field],
    settings: &TextSettings,
) -> Option<String> {
    let mut k = 0usize;
    for ci in columns {
        if ci.column.is_aux {
            continue;
        }
        if let Err(reason) =
            convert::validate_field(&ci.column, &fields[k], settings.truncation_as_error)
        {
            return Some(reason);
        }
        k += 1;
    }
    None
}

/// Read exactly `buf.len()` bytes unless the source ends first; returns the
/// byte count actually read.
fn read_full(input: &mut dyn BufRead, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = input.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brm::{BrmClient, ExtentStripeAllocator, LocalBrm};
    use crate::bulk::JobStatus;
    use crate::data::{JobColumn, LogicalKind};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn settings(delim: u8) -> TextSettings {
        TextSettings {
            delimiter: delim,
            ..TextSettings::default()
        }
    }

    fn texts(fields: &[Field]) -> Vec<Option<String>> {
        fields
            .iter()
            .map(|f| match f {
                Field::Null => None,
                Field::Text(s) => Some(s.clone()),
                Field::Bytes(_) => unreachable!(),
            })
            .collect()
    }

    fn mk_columns(dir: &std::path::Path, cols: Vec<JobColumn>) -> Vec<Arc<ColumnInfo>> {
        let brm = LocalBrm::new(vec![1]);
        let alloc = Arc::new(ExtentStripeAllocator::new(
            3000,
            Arc::clone(&brm) as Arc<dyn BrmClient>,
            16,
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
    fn test_split_plain_fields() {
        let f = split_fields(b"1,abcd,xy", &settings(b','));
        assert_eq!(
            texts(&f),
            vec![
                Some("1".to_string()),
                Some("abcd".to_string()),
                Some("xy".to_string())
            ]
        );
    }

    #[test]
    fn test_split_null_markers() {
        let f = split_fields(b"1,\\N,", &settings(b','));
        assert_eq!(f[1], Field::Null);
        assert_eq!(f[2], Field::Null); // trailing empty field

        let mut s = settings(b',');
        s.null_string_mode = true;
        let f = split_fields(b"NULL,x", &s);
        assert_eq!(f[0], Field::Null);

        // Without null-string mode, the literal stays a value.
        let f = split_fields(b"NULL,x", &settings(b','));
        assert_eq!(f[0], Field::Text("NULL".to_string()));
    }

    #[test]
    fn test_split_enclosed_fields() {
        let mut s = settings(b',');
        s.enclosed_by = Some(b'"');

        let f = split_fields(b"\"a,b\",2", &s);
        assert_eq!(
            texts(&f),
            vec![Some("a,b".to_string()), Some("2".to_string())]
        );

        // Escaped quote inside an enclosed field.
        let f = split_fields(br#""a\"b",2"#, &s);
        assert_eq!(texts(&f)[0], Some("a\"b".to_string()));

        // Enclosed NULL is a literal string, not a null.
        let mut s2 = s.clone();
        s2.null_string_mode = true;
        let f = split_fields(b"\"NULL\",2", &s2);
        assert_eq!(f[0], Field::Text("NULL".to_string()));
    }

    #[test]
    fn test_split_escaped_delimiter() {
        let f = split_fields(br"a\,b,2", &settings(b','));
        assert_eq!(
            texts(&f),
            vec![Some("a,b".to_string()), Some("2".to_string())]
        );
    }

    #[test]
    fn test_fill_rejects_bad_rows() {
        let dir = tempdir().unwrap();
        let cols = mk_columns(
            dir.path(),
            vec![
                JobColumn::new("n", 101, StorageKind::Int, LogicalKind::Int),
                JobColumn::new_char("c", 102, 4),
            ],
        );

        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(b"1,abcd\nbogus,efgh\n2,ok\n1,2,3\n".to_vec());
        let result = buf
            .fill_from_text(&mut input, &cols, &settings(b','), 0, 0, 1 << 20, 10)
            .unwrap();

        assert!(result.eof);
        assert_eq!(result.rows_read, 4);
        assert_eq!(result.rejects.len(), 2);
        assert_eq!(buf.row_count(), 2);
        assert!(result.rejects[0].reason.contains("unable to convert"));
        assert!(result.rejects[1].reason.contains("Column count mismatch"));
        assert_eq!(result.rejects[1].line, 4);
    }

    #[test]
    fn test_fill_stops_past_error_budget() {
        let dir = tempdir().unwrap();
        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new("n", 101, StorageKind::Int, LogicalKind::Int)],
        );

        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(b"x\ny\nz\n1\n".to_vec());
        let result = buf
            .fill_from_text(&mut input, &cols, &settings(b','), 0, 0, 1 << 20, 1)
            .unwrap();

        // Stops after exceeding the budget: 2 rejects collected, not 3.
        assert!(!result.eof);
        assert_eq!(result.rejects.len(), 2);
    }

    #[test]
    fn test_parse_persists_rows_in_order() {
        let dir = tempdir().unwrap();
        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new("n", 101, StorageKind::Int, LogicalKind::Int)],
        );

        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(b"5\n6\n7\n".to_vec());
        buf.fill_from_text(&mut input, &cols, &settings(b','), 0, 0, 1 << 20, 0)
            .unwrap();

        buf.parse(&cols[0], Some(0)).unwrap();
        cols[0].finish_parsing().unwrap();

        let bytes = std::fs::read(&cols[0].mgr().file_paths()[0]).unwrap();
        let vals: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![5, 6, 7]);
    }

    #[test]
    fn test_parse_spans_extent_boundary() {
        let dir = tempdir().unwrap();
        // extent_rows=16 for 8-byte; width 8 -> 16 rows per extent.
        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new(
                "n",
                101,
                StorageKind::LongLong,
                LogicalKind::Int,
            )],
        );

        let lines: String = (0..20).map(|i| format!("{}\n", i)).collect();
        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(lines.into_bytes());
        buf.fill_from_text(&mut input, &cols, &settings(b','), 0, 0, 1 << 20, 0)
            .unwrap();

        buf.parse(&cols[0], Some(0)).unwrap();
        cols[0].finish_parsing().unwrap();

        // Two extent files: 16 rows then 4 rows.
        let paths = cols[0].mgr().file_paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::metadata(&paths[0]).unwrap().len(), 16 * 8);
        assert_eq!(std::fs::metadata(&paths[1]).unwrap().len(), 4 * 8);
    }

    #[test]
    fn test_parse_binary_records() {
        let dir = tempdir().unwrap();
        let cols = mk_columns(
            dir.path(),
            vec![
                JobColumn::new("a", 101, StorageKind::Short, LogicalKind::Int),
                JobColumn::new("b", 102, StorageKind::Int, LogicalKind::Int),
            ],
        );

        let mut data = Vec::new();
        for (a, b) in [(1i16, 100i32), (-2, 200), (3, -300)] {
            data.extend_from_slice(&a.to_le_bytes());
            data.extend_from_slice(&b.to_le_bytes());
        }

        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(data);
        let result = buf
            .fill_from_binary(&mut input, &cols, 6, 0, 0, 1 << 20, 0)
            .unwrap();
        assert!(result.eof);
        assert_eq!(buf.row_count(), 3);

        buf.parse(&cols[0], Some(0)).unwrap();
        buf.parse(&cols[1], Some(1)).unwrap();
        for c in &cols {
            c.finish_parsing().unwrap();
        }

        let b_bytes = std::fs::read(&cols[1].mgr().file_paths()[0]).unwrap();
        let vals: Vec<i32> = b_bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![100, 200, -300]);
    }

    #[test]
    fn test_parse_dictionary_column() {
        let dir = tempdir().unwrap();
        let cols = mk_columns(
            dir.path(),
            vec![JobColumn::new_dict("s", 101, 2001, 16)],
        );

        let buf = RowBuffer::new(0);
        let mut input = Cursor::new(b"alpha\nbeta\nalpha\n\\N\n".to_vec());
        buf.fill_from_text(&mut input, &cols, &settings(b','), 0, 0, 1 << 20, 0)
            .unwrap();

        buf.parse(&cols[0], Some(0)).unwrap();
        cols[0].finish_parsing().unwrap();

        let bytes = std::fs::read(&cols[0].mgr().file_paths()[0]).unwrap();
        let tokens: Vec<u64> = bytes
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0], tokens[2]); // dedup within the extent
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(tokens[3], crate::data::nulls::DICT_NULL_TOKEN);
    }
}
