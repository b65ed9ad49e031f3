//! Value conversion: one input column chunk in, fixed-width on-disk bytes out.
//!
//! Every element walks the same pipeline: null handling (sentinel, column
//! default, or auto-increment), type-specific decoding, saturation against
//! the column's limits, UTF-8-safe truncation for inline CHAR, and extent
//! min/max tracking.  A chunk never spans an extent boundary (the column
//! buffer manager caps reservations at the boundary), so the accumulated
//! stats always belong to exactly one extent.
//!
//! Invalid calendar values (a syntactically plausible but impossible date,
//! an out-of-range timestamp) are stored as zero and counted as saturations;
//! unparseable numeric text is rejected at read time by [`validate_field`]
//! and never reaches conversion.

use arrow::array::{
    Array, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, LargeBinaryArray, LargeStringArray,
    StringArray, Time32MillisecondArray, Time32SecondArray, Time64MicrosecondArray,
    Time64NanosecondArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::datatypes::{DataType, TimeUnit};
use chrono::{Datelike, Timelike};

use crate::data::{
    encode_date, encode_datetime, encode_time, nulls, DefaultValue, JobColumn, LogicalKind,
    StorageKind,
};
use crate::{BulkError, Result};

// ============================================================================
// Input cells
// ============================================================================

/// One field of one input row, as produced by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Text(String),
    /// Fixed-binary mode: the value's raw little-endian bytes.
    Bytes(Vec<u8>),
}

/// A decoded element: present, null, or present-but-invalid.
enum Cell<T> {
    Null,
    Bad,
    Val(T),
}

// ============================================================================
// Per-chunk accumulator
// ============================================================================

/// Running min/max and saturation count for one section's worth of values.
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub min: i64,
    pub max: i64,
    pub wide_min: i128,
    pub wide_max: i128,
    pub sat_count: u64,
    unsigned: bool,
}

impl BufferStats {
    /// Identity element: widest max as min, widest min as max, so any value
    /// folded in becomes both bounds.
    pub fn new(col: &JobColumn) -> Self {
        let unsigned = col.logical.unsigned_range();
        if unsigned {
            Self {
                min: u64::MAX as i64,
                max: 0,
                wide_min: -1, // all ones: u128::MAX
                wide_max: 0,
                sat_count: 0,
                unsigned,
            }
        } else {
            Self {
                min: i64::MAX,
                max: i64::MIN,
                wide_min: i128::MAX,
                wide_max: i128::MIN,
                sat_count: 0,
                unsigned,
            }
        }
    }

    #[inline]
    pub(crate) fn fold(&mut self, v: i64) {
        if self.unsigned {
            if (v as u64) < (self.min as u64) {
                self.min = v;
            }
            if (v as u64) > (self.max as u64) {
                self.max = v;
            }
        } else {
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
        }
    }

    #[inline]
    pub(crate) fn fold_wide(&mut self, v: i128) {
        if self.unsigned {
            if (v as u128) < (self.wide_min as u128) {
                self.wide_min = v;
            }
            if (v as u128) > (self.wide_max as u128) {
                self.wide_max = v;
            }
        } else {
            if v < self.wide_min {
                self.wide_min = v;
            }
            if v > self.wide_max {
                self.wide_max = v;
            }
        }
    }

    /// Whether any value was folded in (empty extents keep the identity).
    pub fn any_values(&self) -> bool {
        if self.unsigned {
            (self.min as u64) <= (self.max as u64) && !(self.min == u64::MAX as i64 && self.max == 0)
        } else {
            self.min <= self.max
        }
    }
}

/// A block of auto-increment values reserved from the BRM for one chunk.
#[derive(Debug)]
pub struct AutoIncRange {
    next: u64,
    remaining: u64,
}

impl AutoIncRange {
    pub fn new(first: u64, count: u64) -> Self {
        Self {
            next: first,
            remaining: count,
        }
    }

    fn next_value(&mut self) -> u64 {
        debug_assert!(self.remaining > 0, "auto-increment range exhausted");
        let v = self.next;
        self.next += 1;
        self.remaining = self.remaining.saturating_sub(1);
        v
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Convert one chunk of reader-produced fields into `out`
/// (`fields.len() * col.width` bytes).
pub fn convert_field_rows(
    col: &JobColumn,
    fields: &[&Field],
    auto_inc: Option<&mut AutoIncRange>,
    stats: &mut BufferStats,
    out: &mut [u8],
) -> Result<()> {
    debug_assert_eq!(out.len(), fields.len() * col.width);
    let n = fields.len();

    match col.storage {
        StorageKind::Byte | StorageKind::Short | StorageKind::Int | StorageKind::LongLong => {
            if col.logical == LogicalKind::Date {
                convert_dates(col, n, |i| text_date(fields[i]), stats, out);
            } else if matches!(
                col.logical,
                LogicalKind::Time | LogicalKind::DateTime | LogicalKind::Timestamp
            ) {
                convert_time_like(col, n, |i| text_time_like(col, fields[i]), stats, out);
            } else {
                convert_signed(col, n, |i| field_i64(col, fields[i]), auto_inc, stats, out);
            }
        }
        StorageKind::UByte | StorageKind::UShort | StorageKind::UInt | StorageKind::ULongLong => {
            convert_unsigned(col, n, |i| field_u64(col, fields[i]), auto_inc, stats, out);
        }
        StorageKind::Float | StorageKind::Double => {
            convert_floats(col, n, |i| field_f64(fields[i]), stats, out);
        }
        StorageKind::Char => {
            convert_chars(col, n, |i| field_bytes(fields[i]), stats, out);
        }
        StorageKind::WideDecimal => {
            convert_wide(col, n, |i| field_i128(col, fields[i]), auto_inc, stats, out);
        }
        StorageKind::Token => {
            return Err(BulkError::Brm(format!(
                "column {} routes through the dictionary, not the value converter",
                col.name
            )));
        }
    }

    Ok(())
}

/// Convert one Arrow array chunk (the Parquet path).
pub fn convert_arrow_chunk(
    col: &JobColumn,
    array: &dyn Array,
    auto_inc: Option<&mut AutoIncRange>,
    stats: &mut BufferStats,
    out: &mut [u8],
) -> Result<()> {
    debug_assert_eq!(out.len(), array.len() * col.width);
    let n = array.len();

    match col.storage {
        StorageKind::Byte | StorageKind::Short | StorageKind::Int | StorageKind::LongLong => {
            if col.logical == LogicalKind::Date {
                let dates = downcast::<Date32Array>(array, col)?;
                convert_dates(col, n, |i| arrow_date(dates, i), stats, out);
            } else if matches!(
                col.logical,
                LogicalKind::Time | LogicalKind::DateTime | LogicalKind::Timestamp
            ) {
                let get = arrow_time_like_getter(col, array)?;
                convert_time_like(col, n, |i| get(i), stats, out);
            } else {
                let get = arrow_i64_getter(col, array)?;
                convert_signed(col, n, |i| get(i), auto_inc, stats, out);
            }
        }
        StorageKind::UByte | StorageKind::UShort | StorageKind::UInt | StorageKind::ULongLong => {
            let get = arrow_u64_getter(col, array)?;
            convert_unsigned(col, n, |i| get(i), auto_inc, stats, out);
        }
        StorageKind::Float => {
            let arr = downcast::<Float32Array>(array, col)?;
            convert_floats(
                col,
                n,
                |i| {
                    if arr.is_null(i) {
                        None
                    } else {
                        Some(arr.value(i) as f64)
                    }
                },
                stats,
                out,
            );
        }
        StorageKind::Double => {
            let arr = downcast::<Float64Array>(array, col)?;
            convert_floats(
                col,
                n,
                |i| if arr.is_null(i) { None } else { Some(arr.value(i)) },
                stats,
                out,
            );
        }
        StorageKind::Char => {
            let get = arrow_bytes_getter(array, col)?;
            convert_chars(col, n, |i| get(i), stats, out);
        }
        StorageKind::WideDecimal => {
            let arr = downcast::<Decimal128Array>(array, col)?;
            let src_scale = match array.data_type() {
                DataType::Decimal128(_, s) => *s as i32,
                _ => col.scale as i32,
            };
            convert_wide(
                col,
                n,
                |i| {
                    if arr.is_null(i) {
                        None
                    } else {
                        let mut sat = false;
                        let v = rescale_i128(arr.value(i), src_scale, col.scale as i32, &mut sat);
                        Some((v, sat))
                    }
                },
                auto_inc,
                stats,
                out,
            );
        }
        StorageKind::Token => {
            return Err(BulkError::Brm(format!(
                "column {} routes through the dictionary, not the value converter",
                col.name
            )));
        }
    }

    Ok(())
}

/// Synthesize the implicit aux column: every row gets the column default.
pub fn convert_aux_rows(col: &JobColumn, rows: usize, stats: &mut BufferStats, out: &mut [u8]) {
    let default = match &col.default {
        Some(DefaultValue::UInt(v)) => *v,
        Some(DefaultValue::Int(v)) => *v as u64,
        _ => 0,
    };

    convert_unsigned(col, rows, |_| Some(Ok(default)), None, stats, out);
}

/// Read-time validation of one text field.  Returns the reject reason for
/// values conversion could not represent at all.
pub fn validate_field(
    col: &JobColumn,
    field: &Field,
    truncation_as_error: bool,
) -> std::result::Result<(), String> {
    let s = match field {
        Field::Null | Field::Bytes(_) => return Ok(()),
        Field::Text(s) => s.trim(),
    };

    let bad = || {
        Err(format!(
            "unable to convert '{}' into a {:?} value for column {}",
            s, col.logical, col.name
        ))
    };

    match col.storage {
        StorageKind::Byte | StorageKind::Short | StorageKind::Int | StorageKind::LongLong => {
            match col.logical {
                LogicalKind::Bool => {
                    if parse_bool(s).is_none() {
                        return bad();
                    }
                }
                LogicalKind::Decimal | LogicalKind::UDecimal => {
                    if parse_decimal_text(s, col.scale as i32).is_none() {
                        return bad();
                    }
                }
                // Invalid calendar text is zeroed (and counted) at convert.
                LogicalKind::Date
                | LogicalKind::Time
                | LogicalKind::DateTime
                | LogicalKind::Timestamp => {}
                _ => {
                    if s.parse::<i64>().is_err() {
                        return bad();
                    }
                }
            }
        }
        StorageKind::UByte | StorageKind::UShort | StorageKind::UInt | StorageKind::ULongLong => {
            if matches!(col.logical, LogicalKind::Decimal | LogicalKind::UDecimal) {
                if parse_decimal_text(s, col.scale as i32).is_none() {
                    return bad();
                }
            } else if s.parse::<u64>().is_err() {
                return bad();
            }
        }
        StorageKind::Float | StorageKind::Double => {
            if s.parse::<f64>().is_err() {
                return bad();
            }
        }
        StorageKind::WideDecimal => {
            if parse_decimal_text(s, col.scale as i32).is_none() {
                return bad();
            }
        }
        StorageKind::Char | StorageKind::Token => {
            if truncation_as_error && s.len() > col.defined_width {
                return Err(format!(
                    "string value exceeds the {} byte limit for column {}",
                    col.defined_width, col.name
                ));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Conversion families
// ============================================================================

/// Signed integer family (also narrow decimals and bools).  The getter
/// yields `None` for null and `Some(Err(()))` for undecodable input.
fn convert_signed<F>(
    col: &JobColumn,
    n: usize,
    get: F,
    mut auto_inc: Option<&mut AutoIncRange>,
    stats: &mut BufferStats,
    out: &mut [u8],
) where
    F: Fn(usize) -> Option<std::result::Result<i64, ()>>,
{
    let width = col.width;
    let max_sat = col.max_int_sat as i64;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let mut v = match get(i) {
            None => {
                if col.auto_increment {
                    match auto_inc.as_deref_mut() {
                        Some(range) => range.next_value() as i64,
                        None => 0,
                    }
                } else {
                    match &col.default {
                        Some(DefaultValue::Int(d)) => *d,
                        Some(DefaultValue::UInt(d)) => *d as i64,
                        _ => {
                            write_null(col, slot);
                            continue;
                        }
                    }
                }
            }
            Some(Ok(v)) => v,
            Some(Err(())) => {
                stats.sat_count += 1;
                0
            }
        };

        if v < col.min_int_sat {
            v = col.min_int_sat;
            stats.sat_count += 1;
        } else if v > max_sat {
            v = max_sat;
            stats.sat_count += 1;
        }

        stats.fold(v);
        slot.copy_from_slice(&v.to_le_bytes()[..width]);
    }
}

/// Unsigned integer family.  Clamps both bounds with unsigned comparison.
fn convert_unsigned<F>(
    col: &JobColumn,
    n: usize,
    get: F,
    mut auto_inc: Option<&mut AutoIncRange>,
    stats: &mut BufferStats,
    out: &mut [u8],
) where
    F: Fn(usize) -> Option<std::result::Result<u64, ()>>,
{
    let width = col.width;
    let min_sat = col.min_int_sat.max(0) as u64;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let mut v = match get(i) {
            None => {
                if col.auto_increment {
                    match auto_inc.as_deref_mut() {
                        Some(range) => range.next_value(),
                        None => 0,
                    }
                } else {
                    match &col.default {
                        Some(DefaultValue::UInt(d)) => *d,
                        Some(DefaultValue::Int(d)) => *d as u64,
                        _ => {
                            write_null(col, slot);
                            continue;
                        }
                    }
                }
            }
            Some(Ok(v)) => v,
            Some(Err(())) => {
                stats.sat_count += 1;
                0
            }
        };

        if v < min_sat {
            v = min_sat;
            stats.sat_count += 1;
        } else if v > col.max_int_sat {
            v = col.max_int_sat;
            stats.sat_count += 1;
        }

        stats.fold(v as i64);
        slot.copy_from_slice(&v.to_le_bytes()[..width]);
    }
}

/// FLOAT and DOUBLE.  No extent range is tracked for floating point.
fn convert_floats<F>(col: &JobColumn, n: usize, get: F, stats: &mut BufferStats, out: &mut [u8])
where
    F: Fn(usize) -> Option<f64>,
{
    let width = col.width;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let mut v = match get(i) {
            None => match &col.default {
                Some(DefaultValue::Dbl(d)) => *d,
                _ => {
                    write_null(col, slot);
                    continue;
                }
            },
            Some(v) => v,
        };

        if v > col.max_dbl_sat {
            v = col.max_dbl_sat;
            stats.sat_count += 1;
        } else if v < col.min_dbl_sat {
            v = col.min_dbl_sat;
            stats.sat_count += 1;
        }

        if width == 4 {
            slot.copy_from_slice(&(v as f32).to_le_bytes());
        } else {
            slot.copy_from_slice(&v.to_le_bytes());
        }
    }
}

/// Inline CHAR.  Values are truncated at a UTF-8 boundary to the declared
/// width (counted as saturation) and range-tracked through a big-endian
/// 8-byte comparison image so that byte order equals collation order.
fn convert_chars<'a, F>(col: &JobColumn, n: usize, get: F, stats: &mut BufferStats, out: &mut [u8])
where
    F: Fn(usize) -> Option<&'a [u8]>,
{
    let width = col.width;
    let default_bytes = match &col.default {
        Some(DefaultValue::Str(s)) => Some(s.as_bytes()),
        _ => None,
    };

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let bytes = match get(i) {
            None => match default_bytes {
                Some(d) => d,
                None => {
                    nulls::char_null(width, slot);
                    continue;
                }
            },
            Some(b) => b,
        };

        let mut tmp = [0u8; 8];
        if bytes.len() > col.defined_width {
            let keep = utf8_truncate_len(bytes, col.defined_width);
            tmp[..keep].copy_from_slice(&bytes[..keep]);
            stats.sat_count += 1;
        } else {
            tmp[..bytes.len()].copy_from_slice(bytes);
        }

        let cmp = u64::from_be_bytes(tmp);
        stats.fold(cmp as i64);

        slot.copy_from_slice(&tmp[..width]);
    }
}

/// 16-byte decimals.  The getter returns the value already rescaled to the
/// column scale, plus whether the rescale saturated.
fn convert_wide<F>(
    col: &JobColumn,
    n: usize,
    get: F,
    mut auto_inc: Option<&mut AutoIncRange>,
    stats: &mut BufferStats,
    out: &mut [u8],
) where
    F: Fn(usize) -> Option<(i128, bool)>,
{
    let width = col.width;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let v = match get(i) {
            None => {
                if col.auto_increment {
                    match auto_inc.as_deref_mut() {
                        Some(range) => range.next_value() as i128,
                        None => 0,
                    }
                } else {
                    match &col.default {
                        Some(DefaultValue::WideDecimal(d)) => *d,
                        Some(DefaultValue::Int(d)) => *d as i128,
                        _ => {
                            slot.copy_from_slice(&nulls::WIDE_DECIMAL_NULL.to_le_bytes());
                            continue;
                        }
                    }
                }
            }
            Some((v, saturated)) => {
                if saturated {
                    stats.sat_count += 1;
                }
                v
            }
        };

        stats.fold_wide(v);
        slot.copy_from_slice(&v.to_le_bytes());
    }
}

/// DATE columns (4-byte storage).  Invalid dates become zero and count as
/// saturations.
fn convert_dates<F>(col: &JobColumn, n: usize, get: F, stats: &mut BufferStats, out: &mut [u8])
where
    F: Fn(usize) -> Cell<u32>,
{
    let width = col.width;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let v: u32 = match get(i) {
            Cell::Null => match &col.default {
                Some(DefaultValue::Int(d)) => *d as u32,
                Some(DefaultValue::UInt(d)) => *d as u32,
                _ => {
                    slot.copy_from_slice(&nulls::DATE_NULL.to_le_bytes());
                    continue;
                }
            },
            Cell::Bad => {
                stats.sat_count += 1;
                0
            }
            Cell::Val(v) => v,
        };

        stats.fold(v as i64);
        slot.copy_from_slice(&v.to_le_bytes());
    }
}

/// TIME / DATETIME / TIMESTAMP columns (8-byte storage).
fn convert_time_like<F>(col: &JobColumn, n: usize, get: F, stats: &mut BufferStats, out: &mut [u8])
where
    F: Fn(usize) -> Cell<i64>,
{
    let width = col.width;

    for i in 0..n {
        let slot = &mut out[i * width..(i + 1) * width];

        let v: i64 = match get(i) {
            Cell::Null => match &col.default {
                Some(DefaultValue::Int(d)) => *d,
                _ => {
                    write_null(col, slot);
                    continue;
                }
            },
            Cell::Bad => {
                stats.sat_count += 1;
                0
            }
            Cell::Val(v) => v,
        };

        stats.fold(v);
        slot.copy_from_slice(&v.to_le_bytes());
    }
}

// ============================================================================
// Null sentinels
// ============================================================================

fn write_null(col: &JobColumn, slot: &mut [u8]) {
    match col.storage {
        StorageKind::Byte => slot[0] = nulls::TINYINT_NULL as u8,
        StorageKind::UByte => slot[0] = nulls::UTINYINT_NULL,
        StorageKind::Short => slot.copy_from_slice(&nulls::SMALLINT_NULL.to_le_bytes()),
        StorageKind::UShort => slot.copy_from_slice(&nulls::USMALLINT_NULL.to_le_bytes()),
        StorageKind::Int => {
            if col.logical == LogicalKind::Date {
                slot.copy_from_slice(&nulls::DATE_NULL.to_le_bytes());
            } else {
                slot.copy_from_slice(&nulls::INT_NULL.to_le_bytes());
            }
        }
        StorageKind::UInt => slot.copy_from_slice(&nulls::UINT_NULL.to_le_bytes()),
        StorageKind::LongLong => match col.logical {
            LogicalKind::Time => slot.copy_from_slice(&nulls::TIME_NULL.to_le_bytes()),
            LogicalKind::DateTime => slot.copy_from_slice(&nulls::DATETIME_NULL.to_le_bytes()),
            LogicalKind::Timestamp => slot.copy_from_slice(&nulls::TIMESTAMP_NULL.to_le_bytes()),
            _ => slot.copy_from_slice(&nulls::BIGINT_NULL.to_le_bytes()),
        },
        StorageKind::ULongLong => slot.copy_from_slice(&nulls::UBIGINT_NULL.to_le_bytes()),
        StorageKind::Float => slot.copy_from_slice(&nulls::FLOAT_NULL.to_le_bytes()),
        StorageKind::Double => slot.copy_from_slice(&nulls::DOUBLE_NULL.to_le_bytes()),
        StorageKind::Char => nulls::char_null(col.width, slot),
        StorageKind::WideDecimal => {
            slot.copy_from_slice(&nulls::WIDE_DECIMAL_NULL.to_le_bytes())
        }
        StorageKind::Token => slot.copy_from_slice(&nulls::DICT_NULL_TOKEN.to_le_bytes()),
    }
}

// ============================================================================
// Text decoding
// ============================================================================

fn field_i64(col: &JobColumn, field: &Field) -> Option<std::result::Result<i64, ()>> {
    match field {
        Field::Null => None,
        Field::Text(s) => {
            let s = s.trim();
            match col.logical {
                LogicalKind::Bool => Some(parse_bool(s).map(|b| b as i64).ok_or(())),
                LogicalKind::Decimal | LogicalKind::UDecimal => Some(
                    parse_decimal_text(s, col.scale as i32)
                        .map(clamp_i128_to_i64)
                        .ok_or(()),
                ),
                _ => Some(s.parse::<i64>().map_err(|_| ())),
            }
        }
        Field::Bytes(b) => decode_binary_signed(col, b),
    }
}

fn field_u64(col: &JobColumn, field: &Field) -> Option<std::result::Result<u64, ()>> {
    match field {
        Field::Null => None,
        Field::Text(s) => {
            let s = s.trim();
            if matches!(col.logical, LogicalKind::Decimal | LogicalKind::UDecimal) {
                Some(
                    parse_decimal_text(s, col.scale as i32)
                        .map(|v| v.clamp(0, u64::MAX as i128) as u64)
                        .ok_or(()),
                )
            } else {
                Some(s.parse::<u64>().map_err(|_| ()))
            }
        }
        Field::Bytes(b) => decode_binary_unsigned(col, b),
    }
}

fn field_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Null => None,
        Field::Text(s) => s.trim().parse::<f64>().ok(),
        Field::Bytes(b) => match b.len() {
            4 => Some(f32::from_le_bytes(b[..4].try_into().expect("4 bytes")) as f64),
            8 => Some(f64::from_le_bytes(b[..8].try_into().expect("8 bytes"))),
            _ => None,
        },
    }
}

fn field_bytes(field: &Field) -> Option<&[u8]> {
    match field {
        Field::Null => None,
        Field::Text(s) => Some(s.as_bytes()),
        Field::Bytes(b) => Some(b.as_slice()),
    }
}

fn field_i128(col: &JobColumn, field: &Field) -> Option<(i128, bool)> {
    match field {
        Field::Null => None,
        Field::Text(s) => parse_decimal_text(s.trim(), col.scale as i32).map(|v| (v, false)),
        Field::Bytes(b) if b.len() == 16 => {
            let v = i128::from_le_bytes(b[..16].try_into().expect("16 bytes"));
            if v == nulls::WIDE_DECIMAL_NULL {
                None
            } else {
                Some((v, false))
            }
        }
        Field::Bytes(_) => None,
    }
}

fn text_date(field: &Field) -> Cell<u32> {
    match field {
        Field::Null => Cell::Null,
        Field::Text(s) => match chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
            Ok(d) => Cell::Val(encode_date(d.year(), d.month(), d.day())),
            Err(_) => Cell::Bad,
        },
        Field::Bytes(b) if b.len() == 4 => {
            let v = u32::from_le_bytes(b[..4].try_into().expect("4 bytes"));
            if v == nulls::DATE_NULL {
                Cell::Null
            } else {
                Cell::Val(v)
            }
        }
        Field::Bytes(_) => Cell::Bad,
    }
}

fn text_time_like(col: &JobColumn, field: &Field) -> Cell<i64> {
    match field {
        Field::Null => Cell::Null,
        Field::Text(s) => {
            let s = s.trim();
            match col.logical {
                LogicalKind::Time => match chrono::NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                    Ok(t) => Cell::Val(encode_time(
                        t.hour(),
                        t.minute(),
                        t.second(),
                        t.nanosecond() / 1000,
                    )),
                    Err(_) => Cell::Bad,
                },
                _ => match chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                    Ok(dt) => Cell::Val(encode_naive_datetime(&dt)),
                    Err(_) => Cell::Bad,
                },
            }
        }
        Field::Bytes(b) if b.len() == 8 => {
            let v = u64::from_le_bytes(b[..8].try_into().expect("8 bytes"));
            if v == nulls::DATETIME_NULL {
                Cell::Null
            } else {
                Cell::Val(v as i64)
            }
        }
        Field::Bytes(_) => Cell::Bad,
    }
}

fn decode_binary_signed(col: &JobColumn, b: &[u8]) -> Option<std::result::Result<i64, ()>> {
    let v = match (col.width, b.len()) {
        (1, 1) => b[0] as i8 as i64,
        (2, 2) => i16::from_le_bytes(b[..2].try_into().expect("2 bytes")) as i64,
        (4, 4) => i32::from_le_bytes(b[..4].try_into().expect("4 bytes")) as i64,
        (8, 8) => i64::from_le_bytes(b[..8].try_into().expect("8 bytes")),
        _ => return Some(Err(())),
    };

    let is_null = match col.width {
        1 => v == nulls::TINYINT_NULL as i64,
        2 => v == nulls::SMALLINT_NULL as i64,
        4 => v == nulls::INT_NULL as i64,
        _ => v == nulls::BIGINT_NULL,
    };

    if is_null {
        None
    } else {
        Some(Ok(v))
    }
}

fn decode_binary_unsigned(col: &JobColumn, b: &[u8]) -> Option<std::result::Result<u64, ()>> {
    let v = match (col.width, b.len()) {
        (1, 1) => b[0] as u64,
        (2, 2) => u16::from_le_bytes(b[..2].try_into().expect("2 bytes")) as u64,
        (4, 4) => u32::from_le_bytes(b[..4].try_into().expect("4 bytes")) as u64,
        (8, 8) => u64::from_le_bytes(b[..8].try_into().expect("8 bytes")),
        _ => return Some(Err(())),
    };

    let is_null = match col.width {
        1 => v == nulls::UTINYINT_NULL as u64,
        2 => v == nulls::USMALLINT_NULL as u64,
        4 => v == nulls::UINT_NULL as u64,
        _ => v == nulls::UBIGINT_NULL,
    };

    if is_null {
        None
    } else {
        Some(Ok(v))
    }
}

// ============================================================================
// Arrow decoding
// ============================================================================

fn downcast<'a, T: 'static>(array: &'a dyn Array, col: &JobColumn) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        BulkError::Parquet(format!(
            "column {}: unexpected Arrow type {:?}",
            col.name,
            array.data_type()
        ))
    })
}

type I64Getter<'a> = Box<dyn Fn(usize) -> Option<std::result::Result<i64, ()>> + 'a>;
type U64Getter<'a> = Box<dyn Fn(usize) -> Option<std::result::Result<u64, ()>> + 'a>;
type CellGetter<'a> = Box<dyn Fn(usize) -> Cell<i64> + 'a>;
type BytesGetter<'a> = Box<dyn Fn(usize) -> Option<&'a [u8]> + 'a>;

fn arrow_i64_getter<'a>(col: &JobColumn, array: &'a dyn Array) -> Result<I64Getter<'a>> {
    macro_rules! prim {
        ($ty:ty) => {{
            let arr = downcast::<$ty>(array, col)?;
            Ok(Box::new(move |i| {
                if arr.is_null(i) {
                    None
                } else {
                    Some(Ok(arr.value(i) as i64))
                }
            }) as I64Getter<'a>)
        }};
    }

    match array.data_type() {
        DataType::Int8 => prim!(Int8Array),
        DataType::Int16 => prim!(Int16Array),
        DataType::Int32 => prim!(Int32Array),
        DataType::Int64 => prim!(Int64Array),
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array, col)?;
            Ok(Box::new(move |i| {
                if arr.is_null(i) {
                    None
                } else {
                    Some(Ok(arr.value(i) as i64))
                }
            }))
        }
        DataType::Decimal128(_, src_scale) => {
            let arr = downcast::<Decimal128Array>(array, col)?;
            let src_scale = *src_scale as i32;
            let dst_scale = col.scale as i32;
            Ok(Box::new(move |i| {
                if arr.is_null(i) {
                    None
                } else {
                    let mut sat = false;
                    let v = rescale_i128(arr.value(i), src_scale, dst_scale, &mut sat);
                    // Saturation to the storage width happens in the caller.
                    Some(Ok(clamp_i128_to_i64(v)))
                }
            }))
        }
        other => Err(BulkError::Parquet(format!(
            "column {}: cannot ingest Arrow {:?} into {:?}",
            col.name, other, col.storage
        ))),
    }
}

fn arrow_u64_getter<'a>(col: &JobColumn, array: &'a dyn Array) -> Result<U64Getter<'a>> {
    macro_rules! prim {
        ($ty:ty) => {{
            let arr = downcast::<$ty>(array, col)?;
            Ok(Box::new(move |i| {
                if arr.is_null(i) {
                    None
                } else {
                    Some(Ok(arr.value(i) as u64))
                }
            }) as U64Getter<'a>)
        }};
    }

    match array.data_type() {
        DataType::UInt8 => prim!(UInt8Array),
        DataType::UInt16 => prim!(UInt16Array),
        DataType::UInt32 => prim!(UInt32Array),
        DataType::UInt64 => prim!(UInt64Array),
        other => Err(BulkError::Parquet(format!(
            "column {}: cannot ingest Arrow {:?} into {:?}",
            col.name, other, col.storage
        ))),
    }
}

fn arrow_date(arr: &Date32Array, i: usize) -> Cell<u32> {
    if arr.is_null(i) {
        return Cell::Null;
    }

    let days = arr.value(i);
    // Days since 1970-01-01; 719,163 days from the common era to the epoch.
    match chrono::NaiveDate::from_num_days_from_ce_opt(days.saturating_add(719_163)) {
        Some(d) => Cell::Val(encode_date(d.year(), d.month(), d.day())),
        None => Cell::Bad,
    }
}

fn arrow_time_like_getter<'a>(col: &JobColumn, array: &'a dyn Array) -> Result<CellGetter<'a>> {
    match (col.logical, array.data_type()) {
        (LogicalKind::Time, DataType::Time32(unit)) => {
            let unit = *unit;
            match unit {
                TimeUnit::Second => {
                    let arr = downcast::<Time32SecondArray>(array, col)?;
                    Ok(Box::new(move |i| {
                        if arr.is_null(i) {
                            Cell::Null
                        } else {
                            seconds_to_time(arr.value(i) as i64, 0)
                        }
                    }))
                }
                _ => {
                    let arr = downcast::<Time32MillisecondArray>(array, col)?;
                    Ok(Box::new(move |i| {
                        if arr.is_null(i) {
                            Cell::Null
                        } else {
                            let ms = arr.value(i) as i64;
                            seconds_to_time(ms / 1000, (ms % 1000) as u32 * 1000)
                        }
                    }))
                }
            }
        }
        (LogicalKind::Time, DataType::Time64(unit)) => {
            let unit = *unit;
            match unit {
                TimeUnit::Nanosecond => {
                    let arr = downcast::<Time64NanosecondArray>(array, col)?;
                    Ok(Box::new(move |i| {
                        if arr.is_null(i) {
                            Cell::Null
                        } else {
                            let us = arr.value(i) / 1000;
                            seconds_to_time(us / 1_000_000, (us % 1_000_000) as u32
                            )
                        }
                    }))
                }
                _ => {
                    let arr = downcast::<Time64MicrosecondArray>(array, col)?;
                    Ok(Box::new(move |i| {
                        if arr.is_null(i) {
                            Cell::Null
                        } else {
                            let us = arr.value(i);
                            seconds_to_time(us / 1_000_000, (us % 1_000_000) as u32)
                        }
                    }))
                }
            }
        }
        (_, DataType::Timestamp(unit, _)) => {
            let tz_micros = col.timezone_offset_secs * 1_000_000;
            let to_micros: Box<dyn Fn(usize) -> Option<i64> + 'a> = match unit {
                TimeUnit::Second => {
                    let arr = downcast::<TimestampSecondArray>(array, col)?;
                    Box::new(move |i| {
                        (!arr.is_null(i)).then(|| arr.value(i).saturating_mul(1_000_000))
                    })
                }
                TimeUnit::Millisecond => {
                    let arr = downcast::<TimestampMillisecondArray>(array, col)?;
                    Box::new(move |i| (!arr.is_null(i)).then(|| arr.value(i).saturating_mul(1000)))
                }
                TimeUnit::Microsecond => {
                    let arr = downcast::<TimestampMicrosecondArray>(array, col)?;
                    Box::new(move |i| (!arr.is_null(i)).then(|| arr.value(i)))
                }
                TimeUnit::Nanosecond => {
                    let arr = downcast::<TimestampNanosecondArray>(array, col)?;
                    Box::new(move |i| (!arr.is_null(i)).then(|| arr.value(i) / 1000))
                }
            };

            Ok(Box::new(move |i| match to_micros(i) {
                None => Cell::Null,
                Some(us) => micros_to_datetime(us.saturating_add(tz_micros)),
            }))
        }
        (_, other) => Err(BulkError::Parquet(format!(
            "column {}: cannot ingest Arrow {:?} into {:?}",
            col.name, other, col.logical
        ))),
    }
}

fn arrow_bytes_getter<'a>(array: &'a dyn Array, col: &JobColumn) -> Result<BytesGetter<'a>> {
    match array.data_type() {
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(array, col)?;
            Ok(Box::new(move |i| {
                (!arr.is_null(i)).then(|| arr.value(i).as_bytes())
            }))
        }
        DataType::LargeUtf8 => {
            let arr = downcast::<LargeStringArray>(array, col)?;
            Ok(Box::new(move |i| {
                (!arr.is_null(i)).then(|| arr.value(i).as_bytes())
            }))
        }
        DataType::Binary => {
            let arr = downcast::<BinaryArray>(array, col)?;
            Ok(Box::new(move |i| (!arr.is_null(i)).then(|| arr.value(i))))
        }
        DataType::LargeBinary => {
            let arr = downcast::<LargeBinaryArray>(array, col)?;
            Ok(Box::new(move |i| (!arr.is_null(i)).then(|| arr.value(i))))
        }
        other => Err(BulkError::Parquet(format!(
            "column {}: cannot ingest Arrow {:?} as a string",
            col.name, other
        ))),
    }
}

/// Bytes getter for the dictionary path (shared with convert_chars inputs).
pub fn arrow_string_at(array: &dyn Array, i: usize) -> Result<Option<Vec<u8>>> {
    match array.data_type() {
        DataType::Utf8 => {
            let arr = array.as_any().downcast_ref::<StringArray>().expect("Utf8");
            Ok((!arr.is_null(i)).then(|| arr.value(i).as_bytes().to_vec()))
        }
        DataType::LargeUtf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<LargeStringArray>()
                .expect("LargeUtf8");
            Ok((!arr.is_null(i)).then(|| arr.value(i).as_bytes().to_vec()))
        }
        DataType::Binary => {
            let arr = array.as_any().downcast_ref::<BinaryArray>().expect("Binary");
            Ok((!arr.is_null(i)).then(|| arr.value(i).to_vec()))
        }
        other => Err(BulkError::Parquet(format!(
            "cannot ingest Arrow {:?} into a dictionary column",
            other
        ))),
    }
}

// ============================================================================
// Scalar helpers
// ============================================================================

fn seconds_to_time(secs: i64, micros: u32) -> Cell<i64> {
    if !(0..86_400).contains(&secs) {
        return Cell::Bad;
    }
    let h = (secs / 3600) as u32;
    let m = ((secs % 3600) / 60) as u32;
    let s = (secs % 60) as u32;
    Cell::Val(encode_time(h, m, s, micros))
}

fn micros_to_datetime(us: i64) -> Cell<i64> {
    match chrono::DateTime::from_timestamp(us.div_euclid(1_000_000), 0) {
        Some(dt) => {
            let naive = dt.naive_utc();
            let sub_us = us.rem_euclid(1_000_000) as u32;
            Cell::Val(encode_datetime(
                naive.year(),
                naive.month(),
                naive.day(),
                naive.hour(),
                naive.minute(),
                naive.second(),
                sub_us,
            ))
        }
        None => Cell::Bad,
    }
}

fn encode_naive_datetime(dt: &chrono::NaiveDateTime) -> i64 {
    encode_datetime(
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.nanosecond() / 1000,
    )
}

fn parse_bool(s: &str) -> Option<bool> {
    if s == "1" || s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s == "0" || s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse decimal text into an i128 scaled to `scale` fractional digits,
/// truncating extra fractional digits.
fn parse_decimal_text(s: &str, scale: i32) -> Option<i128> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (neg, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let mut v: i128 = 0;
    for b in int_part.bytes() {
        v = v.checked_mul(10)?.checked_add((b - b'0') as i128)?;
    }

    let scale = scale.max(0) as usize;
    for k in 0..scale {
        let digit = frac_part.as_bytes().get(k).map(|b| b - b'0').unwrap_or(0);
        v = v.checked_mul(10)?.checked_add(digit as i128)?;
    }

    Some(if neg { -v } else { v })
}

/// Rescale a 128-bit decimal between scales, saturating on overflow.
fn rescale_i128(v: i128, from: i32, to: i32, sat: &mut bool) -> i128 {
    use std::cmp::Ordering;

    match to.cmp(&from) {
        Ordering::Equal => v,
        Ordering::Greater => {
            let mut out = v;
            for _ in 0..(to - from) {
                out = match out.checked_mul(10) {
                    Some(x) => x,
                    None => {
                        *sat = true;
                        return if v < 0 { i128::MIN } else { i128::MAX };
                    }
                };
            }
            out
        }
        Ordering::Less => {
            let mut out = v;
            for _ in 0..(from - to) {
                out /= 10;
            }
            out
        }
    }
}

fn clamp_i128_to_i64(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Longest prefix of `bytes` not exceeding `max` that ends on a UTF-8
/// character boundary.
pub(crate) fn utf8_truncate_len(bytes: &[u8], max: usize) -> usize {
    if bytes.len() <= max {
        return bytes.len();
    }
    let mut k = max;
    while k > 0 && (bytes[k] & 0xC0) == 0x80 {
        k -= 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::nulls::*;

    fn text(s: &str) -> Field {
        Field::Text(s.to_string())
    }

    fn run_fields(col: &JobColumn, fields: &[Field]) -> (Vec<u8>, BufferStats) {
        let refs: Vec<&Field> = fields.iter().collect();
        let mut stats = BufferStats::new(col);
        let mut out = vec![0u8; fields.len() * col.width];
        convert_field_rows(col, &refs, None, &mut stats, &mut out).unwrap();
        (out, stats)
    }

    #[test]
    fn test_tinyint_saturation() {
        let col = JobColumn::new("t", 1, StorageKind::Byte, LogicalKind::Int);
        let (out, stats) = run_fields(&col, &[text("200"), text("-300"), text("5")]);

        assert_eq!(out, vec![127u8, 0x80, 5]);
        assert_eq!(stats.sat_count, 2);
        assert_eq!(stats.min, -128);
        assert_eq!(stats.max, 127);
    }

    #[test]
    fn test_saturation_idempotent() {
        let col = JobColumn::new("t", 1, StorageKind::Byte, LogicalKind::Int);
        let (first, _) = run_fields(&col, &[text("200"), text("-300"), text("5")]);

        // Feed the persisted values back through: same bytes, no new
        // saturations.
        let again: Vec<Field> = first.iter().map(|b| text(&(*b as i8).to_string())).collect();
        let (second, stats) = run_fields(&col, &again);
        assert_eq!(first, second);
        assert_eq!(stats.sat_count, 0);
    }

    #[test]
    fn test_char_truncation_utf8_safe() {
        let mut col = JobColumn::new_char("c", 1, 3);
        col.defined_width = 3;
        let (out, stats) = run_fields(&col, &[text("héllo")]);

        // "héllo" is 68 C3 A9 6C 6C 6F; 3 bytes keeps "hé" intact.
        assert_eq!(out, vec![0x68, 0xC3, 0xA9, 0x00]);
        assert_eq!(stats.sat_count, 1);
    }

    #[test]
    fn test_char_truncation_never_splits_a_character() {
        let col = JobColumn::new_char("c", 1, 2);
        let (out, stats) = run_fields(&col, &[text("hé")]);

        // 0xC3 0xA9 would be split at byte 2; only "h" survives.
        assert_eq!(out, vec![0x68, 0x00]);
        assert_eq!(stats.sat_count, 1);
    }

    #[test]
    fn test_null_sentinels() {
        let cases: Vec<(JobColumn, Vec<u8>)> = vec![
            (
                JobColumn::new("a", 1, StorageKind::Byte, LogicalKind::Int),
                vec![0x80],
            ),
            (
                JobColumn::new("b", 2, StorageKind::Short, LogicalKind::Int),
                SMALLINT_NULL.to_le_bytes().to_vec(),
            ),
            (
                JobColumn::new("c", 3, StorageKind::UInt, LogicalKind::UInt),
                UINT_NULL.to_le_bytes().to_vec(),
            ),
            (
                JobColumn::new("d", 4, StorageKind::Double, LogicalKind::Double),
                DOUBLE_NULL.to_le_bytes().to_vec(),
            ),
            (
                JobColumn::new("e", 5, StorageKind::Int, LogicalKind::Date),
                DATE_NULL.to_le_bytes().to_vec(),
            ),
        ];

        for (col, expected) in cases {
            let (out, _) = run_fields(&col, &[Field::Null]);
            assert_eq!(out, expected, "column {}", col.name);
        }

        let char_col = JobColumn::new_char("f", 6, 4);
        let (out, _) = run_fields(&char_col, &[Field::Null]);
        assert_eq!(out, vec![0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_null_with_default_goes_through_saturation() {
        let col = JobColumn::new("t", 1, StorageKind::Byte, LogicalKind::Int)
            .with_default(DefaultValue::Int(999));
        let (out, stats) = run_fields(&col, &[Field::Null]);

        assert_eq!(out, vec![127]);
        assert_eq!(stats.sat_count, 1);
    }

    #[test]
    fn test_auto_increment_consumes_reserved_range() {
        let col =
            JobColumn::new("id", 1, StorageKind::Int, LogicalKind::Int).with_auto_increment();
        let fields = vec![Field::Null, text("50"), Field::Null];
        let refs: Vec<&Field> = fields.iter().collect();

        let mut range = AutoIncRange::new(100, 2);
        let mut stats = BufferStats::new(&col);
        let mut out = vec![0u8; 12];
        convert_field_rows(&col, &refs, Some(&mut range), &mut stats, &mut out).unwrap();

        assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 100);
        assert_eq!(i32::from_le_bytes(out[4..8].try_into().unwrap()), 50);
        assert_eq!(i32::from_le_bytes(out[8..12].try_into().unwrap()), 101);
    }

    #[test]
    fn test_unsigned_clamps_both_bounds() {
        let mut col = JobColumn::new("u", 1, StorageKind::ULongLong, LogicalKind::UInt);
        col.min_int_sat = 10;
        col.max_int_sat = 1000;

        let (out, stats) = run_fields(&col, &[text("5"), text("2000"), text("500")]);
        assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 10);
        assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 1000);
        assert_eq!(u64::from_le_bytes(out[16..24].try_into().unwrap()), 500);
        assert_eq!(stats.sat_count, 2);
    }

    #[test]
    fn test_unsigned_range_tracking() {
        let col = JobColumn::new("u", 1, StorageKind::ULongLong, LogicalKind::UInt);
        let (_, stats) = run_fields(&col, &[text("18446744073709551610"), text("7")]);

        // Folded as unsigned: min is 7, max is the huge value.
        assert_eq!(stats.min as u64, 7);
        assert_eq!(stats.max as u64, 18446744073709551610);
    }

    #[test]
    fn test_date_text_and_invalid() {
        let col = JobColumn::new("d", 1, StorageKind::Int, LogicalKind::Date);
        let (out, stats) = run_fields(&col, &[text("2024-02-29"), text("2023-02-30")]);

        let good = u32::from_le_bytes(out[0..4].try_into().unwrap());
        assert_eq!(good, encode_date(2024, 2, 29));

        // Invalid date becomes zero and counts as a saturation.
        let bad = u32::from_le_bytes(out[4..8].try_into().unwrap());
        assert_eq!(bad, 0);
        assert_eq!(stats.sat_count, 1);
    }

    #[test]
    fn test_datetime_text() {
        let col = JobColumn::new("ts", 1, StorageKind::LongLong, LogicalKind::DateTime);
        let (out, _) = run_fields(&col, &[text("2023-05-01 12:30:45")]);
        let v = i64::from_le_bytes(out[0..8].try_into().unwrap());
        assert_eq!(v, encode_datetime(2023, 5, 1, 12, 30, 45, 0));
    }

    #[test]
    fn test_decimal_text_scaling() {
        assert_eq!(parse_decimal_text("123.45", 2), Some(12345));
        assert_eq!(parse_decimal_text("-0.5", 2), Some(-50));
        assert_eq!(parse_decimal_text("7", 3), Some(7000));
        assert_eq!(parse_decimal_text("1.999", 2), Some(199));
        assert_eq!(parse_decimal_text("abc", 2), None);
    }

    #[test]
    fn test_wide_decimal_rescale_saturates() {
        let mut sat = false;
        assert_eq!(rescale_i128(5, 2, 4, &mut sat), 500);
        assert!(!sat);

        rescale_i128(i128::MAX / 2, 0, 2, &mut sat);
        assert!(sat);

        let mut sat2 = false;
        assert_eq!(rescale_i128(12345, 4, 2, &mut sat2), 123);
        assert!(!sat2);
    }

    #[test]
    fn test_validate_rejects_bad_numerics() {
        let col = JobColumn::new("n", 1, StorageKind::Int, LogicalKind::Int);
        assert!(validate_field(&col, &text("12"), false).is_ok());
        assert!(validate_field(&col, &text("abc"), false).is_err());
        assert!(validate_field(&col, &Field::Null, false).is_ok());

        let chr = JobColumn::new_char("c", 2, 3);
        assert!(validate_field(&chr, &text("abcd"), false).is_ok());
        assert!(validate_field(&chr, &text("abcd"), true).is_err());
    }

    #[test]
    fn test_arrow_int_chunk() {
        use arrow::array::Int32Array;

        let col = JobColumn::new("i", 1, StorageKind::Int, LogicalKind::Int);
        let arr = Int32Array::from(vec![Some(5), None, Some(-9)]);

        let mut stats = BufferStats::new(&col);
        let mut out = vec![0u8; 12];
        convert_arrow_chunk(&col, &arr, None, &mut stats, &mut out).unwrap();

        assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 5);
        assert_eq!(
            i32::from_le_bytes(out[4..8].try_into().unwrap()),
            INT_NULL
        );
        assert_eq!(i32::from_le_bytes(out[8..12].try_into().unwrap()), -9);
        assert_eq!((stats.min, stats.max), (-9, 5));
    }

    #[test]
    fn test_arrow_decimal_into_bigint() {
        use arrow::array::Decimal128Array;

        let mut col = JobColumn::new("d", 1, StorageKind::LongLong, LogicalKind::Decimal);
        col.scale = 2;

        // Source scale 4 -> column scale 2 divides by 100.
        let arr = Decimal128Array::from(vec![Some(123_456_i128), None])
            .with_precision_and_scale(10, 4)
            .unwrap();

        let mut stats = BufferStats::new(&col);
        let mut out = vec![0u8; 16];
        convert_arrow_chunk(&col, &arr, None, &mut stats, &mut out).unwrap();

        assert_eq!(i64::from_le_bytes(out[0..8].try_into().unwrap()), 1234);
        assert_eq!(
            i64::from_le_bytes(out[8..16].try_into().unwrap()),
            BIGINT_NULL
        );
    }

    #[test]
    fn test_arrow_bool_widens_to_byte() {
        use arrow::array::BooleanArray;

        let col = JobColumn::new("b", 1, StorageKind::Byte, LogicalKind::Bool);
        let arr = BooleanArray::from(vec![Some(true), Some(false), None]);

        let mut stats = BufferStats::new(&col);
        let mut out = vec![0u8; 3];
        convert_arrow_chunk(&col, &arr, None, &mut stats, &mut out).unwrap();

        assert_eq!(out, vec![1, 0, 0x80]);
    }

    #[test]
    fn test_aux_rows_synthesized() {
        let col = JobColumn::new_aux(3001);
        let mut stats = BufferStats::new(&col);
        let mut out = vec![0u8; 4];
        convert_aux_rows(&col, 4, &mut stats, &mut out);

        assert_eq!(out, vec![1, 1, 1, 1]);
        assert_eq!(stats.max as u64, 1);
    }

    #[test]
    fn test_char_range_orders_lexicographically() {
        let col = JobColumn::new_char("c", 1, 4);
        let (_, stats) = run_fields(&col, &[text("bb"), text("aa"), text("cc")]);

        let min = (stats.min as u64).to_be_bytes();
        let max = (stats.max as u64).to_be_bytes();
        assert_eq!(&min[..2], b"aa");
        assert_eq!(&max[..2], b"cc");
    }

    #[test]
    fn test_empty_stats_identity() {
        let col = JobColumn::new("i", 1, StorageKind::Int, LogicalKind::Int);
        let stats = BufferStats::new(&col);
        assert!(!stats.any_values());

        let (_, stats) = run_fields(&col, &[Field::Null]);
        assert!(!stats.any_values());
    }
}
