//! Column data model: on-disk storage kinds, logical types, null sentinels,
//! saturation limits, and the static per-column import metadata.
//!
//! Every column stores fixed-width values (1/2/4/8/16 bytes).  CHAR/VARCHAR
//! longer than 8 bytes go through the dictionary and store an 8-byte token
//! instead of the text itself.

use serde::{Deserialize, Serialize};

// ============================================================================
// Null sentinels
// ============================================================================

/// Fixed per-type null encodings.  Signed integers use the most negative
/// value; unsigned integers use MAX-1 so MAX stays usable as an "empty"
/// marker elsewhere in the engine.
pub mod nulls {
    pub const TINYINT_NULL: i8 = i8::MIN;
    pub const SMALLINT_NULL: i16 = i16::MIN;
    pub const INT_NULL: i32 = i32::MIN;
    pub const BIGINT_NULL: i64 = i64::MIN;

    pub const UTINYINT_NULL: u8 = u8::MAX - 1;
    pub const USMALLINT_NULL: u16 = u16::MAX - 1;
    pub const UINT_NULL: u32 = u32::MAX - 1;
    pub const UBIGINT_NULL: u64 = u64::MAX - 1;

    pub const FLOAT_NULL: u32 = 0xFFAA_AAAA;
    pub const DOUBLE_NULL: u64 = 0xFFFA_AAAA_AAAA_AAAA;

    pub const DATE_NULL: u32 = 0xFFFF_FFFE;
    pub const TIME_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFE;
    pub const DATETIME_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFE;
    pub const TIMESTAMP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFE;

    pub const WIDE_DECIMAL_NULL: i128 = i128::MIN;

    /// Dictionary token stored for a null string.
    pub const DICT_NULL_TOKEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;

    /// CHAR null: width-1 bytes of 0xFF followed by 0xFE.
    pub fn char_null(width: usize, out: &mut [u8]) {
        for b in out.iter_mut().take(width - 1) {
            *b = 0xFF;
        }
        out[width - 1] = 0xFE;
    }
}

// ============================================================================
// Type enums
// ============================================================================

/// On-disk storage kind of a column (fixed width encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Byte,
    UByte,
    Short,
    UShort,
    Int,
    UInt,
    LongLong,
    ULongLong,
    Float,
    Double,
    Char,
    WideDecimal,
    /// 8-byte dictionary token; the text lives in the paired store file.
    Token,
}

impl StorageKind {
    /// Fixed on-disk width in bytes.  CHAR width varies with the declared
    /// length and is held in [`JobColumn::width`] instead.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            StorageKind::Byte | StorageKind::UByte => Some(1),
            StorageKind::Short | StorageKind::UShort => Some(2),
            StorageKind::Int | StorageKind::UInt | StorageKind::Float => Some(4),
            StorageKind::LongLong
            | StorageKind::ULongLong
            | StorageKind::Double
            | StorageKind::Token => Some(8),
            StorageKind::WideDecimal => Some(16),
            StorageKind::Char => None,
        }
    }
}

/// Logical (catalog) type of a column.  Decides signed-vs-unsigned range
/// comparison, calendar decoding, and the wording of saturation warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalKind {
    Int,
    UInt,
    Decimal,
    UDecimal,
    Float,
    Double,
    Char,
    VarChar,
    Date,
    DateTime,
    Time,
    Timestamp,
    Bool,
}

impl LogicalKind {
    /// Whether extent min/max tracking compares values as unsigned.
    pub fn unsigned_range(&self) -> bool {
        matches!(
            self,
            LogicalKind::UInt
                | LogicalKind::UDecimal
                | LogicalKind::Char
                | LogicalKind::VarChar
        )
    }
}

/// Storage width for an inline CHAR of the given declared byte length.
pub fn char_storage_width(defined_width: usize) -> usize {
    match defined_width {
        0..=1 => 1,
        2 => 2,
        3..=4 => 4,
        _ => 8,
    }
}

// ============================================================================
// Column metadata
// ============================================================================

/// Typed column default applied to null input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    Int(i64),
    UInt(u64),
    Dbl(f64),
    Str(String),
    WideDecimal(i128),
}

/// Dictionary pairing for token columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryInfo {
    /// Object id of the dictionary store file.
    pub oid: u32,
}

/// Static import metadata for one column, fixed for the life of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobColumn {
    pub name: String,
    /// Object id of the column's segment files.
    pub oid: u32,
    pub storage: StorageKind,
    pub logical: LogicalKind,
    /// On-disk width in bytes: 1, 2, 4, 8, or 16.
    pub width: usize,
    /// Declared byte length for CHAR/VARCHAR; equals `width` otherwise.
    pub defined_width: usize,
    pub compression: u8,
    pub auto_increment: bool,
    pub default: Option<DefaultValue>,
    /// Decimal scale (digits right of the point); 0 for non-decimals.
    pub scale: u32,
    pub precision: u32,
    pub min_int_sat: i64,
    pub max_int_sat: u64,
    pub min_dbl_sat: f64,
    pub max_dbl_sat: f64,
    pub dictionary: Option<DictionaryInfo>,
    /// Session timezone offset applied when converting timestamp instants
    /// to wall-clock datetimes.
    pub timezone_offset_secs: i64,
    /// Implicit trailing engine column; rows never carry a field for it.
    pub is_aux: bool,
}

impl JobColumn {
    /// Column with the saturation range implied by its storage kind.
    pub fn new(name: &str, oid: u32, storage: StorageKind, logical: LogicalKind) -> Self {
        let width = storage.fixed_width().unwrap_or(1);
        let (min_int_sat, max_int_sat) = int_sat_range(storage);
        let (min_dbl_sat, max_dbl_sat) = match storage {
            StorageKind::Float => (f32::MIN as f64, f32::MAX as f64),
            _ => (f64::MIN, f64::MAX),
        };

        Self {
            name: name.to_string(),
            oid,
            storage,
            logical,
            width,
            defined_width: width,
            compression: 0,
            auto_increment: false,
            default: None,
            scale: 0,
            precision: 0,
            min_int_sat,
            max_int_sat,
            min_dbl_sat,
            max_dbl_sat,
            dictionary: None,
            timezone_offset_secs: 0,
            is_aux: false,
        }
    }

    /// Inline CHAR(n) column (n <= 8 bytes).
    pub fn new_char(name: &str, oid: u32, defined_width: usize) -> Self {
        let mut col = Self::new(name, oid, StorageKind::Char, LogicalKind::Char);
        col.width = char_storage_width(defined_width);
        col.defined_width = defined_width;
        col
    }

    /// Dictionary-backed string column storing 8-byte tokens.
    pub fn new_dict(name: &str, oid: u32, dict_oid: u32, defined_width: usize) -> Self {
        let mut col = Self::new(name, oid, StorageKind::Token, LogicalKind::VarChar);
        col.defined_width = defined_width;
        col.dictionary = Some(DictionaryInfo { oid: dict_oid });
        col
    }

    /// The implicit trailing aux column: 1-byte unsigned with a default.
    pub fn new_aux(oid: u32) -> Self {
        let mut col = Self::new("aux", oid, StorageKind::UByte, LogicalKind::UInt);
        col.default = Some(DefaultValue::UInt(1));
        col.is_aux = true;
        col
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn with_timezone_offset(mut self, secs: i64) -> Self {
        self.timezone_offset_secs = secs;
        self
    }
}

fn int_sat_range(storage: StorageKind) -> (i64, u64) {
    match storage {
        StorageKind::Byte => (i8::MIN as i64, i8::MAX as u64),
        StorageKind::UByte => (0, u8::MAX as u64 - 2),
        StorageKind::Short => (i16::MIN as i64, i16::MAX as u64),
        StorageKind::UShort => (0, u16::MAX as u64 - 2),
        StorageKind::Int => (i32::MIN as i64, i32::MAX as u64),
        StorageKind::UInt => (0, u32::MAX as u64 - 2),
        StorageKind::LongLong => (i64::MIN, i64::MAX as u64),
        StorageKind::ULongLong => (0, u64::MAX - 2),
        _ => (i64::MIN, i64::MAX as u64),
    }
}

// ============================================================================
// Physical addressing
// ============================================================================

/// Physical location and high water mark of a column's current segment file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRootExtentInfo {
    pub dbroot: u16,
    pub partition: u32,
    pub segment: u16,
    /// Block index of the last written block in the segment file.
    pub local_hwm: u64,
}

// ============================================================================
// Calendar encodings
// ============================================================================

/// Packed on-disk date: year(16) | month(4) | day(6) | spare(6).
pub fn encode_date(year: i32, month: u32, day: u32) -> u32 {
    ((year as u32) << 16) | (month << 12) | (day << 6) | 0x3E
}

/// Packed on-disk time of day with microseconds.
pub fn encode_time(hour: u32, minute: u32, second: u32, micros: u32) -> i64 {
    ((hour as i64) << 40) | ((minute as i64) << 32) | ((second as i64) << 24) | micros as i64
}

/// Packed on-disk datetime: date in the high 32 bits, time in the low 32.
pub fn encode_datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> i64 {
    let date = encode_date(year, month, day) as i64;
    let time = ((hour as i64) << 26) | ((minute as i64) << 20) | ((second as i64) << 14)
        | ((micros / 64) as i64);
    (date << 32) | time
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(StorageKind::Byte.fixed_width(), Some(1));
        assert_eq!(StorageKind::ULongLong.fixed_width(), Some(8));
        assert_eq!(StorageKind::WideDecimal.fixed_width(), Some(16));
        assert_eq!(StorageKind::Char.fixed_width(), None);

        assert_eq!(char_storage_width(1), 1);
        assert_eq!(char_storage_width(3), 4);
        assert_eq!(char_storage_width(4), 4);
        assert_eq!(char_storage_width(7), 8);
    }

    #[test]
    fn test_char_null_sentinel() {
        let mut buf = [0u8; 4];
        nulls::char_null(4, &mut buf);
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_saturation_ranges() {
        let c = JobColumn::new("t", 1, StorageKind::Byte, LogicalKind::Int);
        assert_eq!(c.min_int_sat, -128);
        assert_eq!(c.max_int_sat, 127);

        let u = JobColumn::new("u", 2, StorageKind::UShort, LogicalKind::UInt);
        assert_eq!(u.min_int_sat, 0);
        assert_eq!(u.max_int_sat, 65533);
    }

    #[test]
    fn test_date_encoding_orders() {
        let a = encode_date(2023, 5, 1);
        let b = encode_date(2023, 5, 2);
        let c = encode_date(2024, 1, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_datetime_encoding_orders() {
        let a = encode_datetime(2023, 5, 1, 0, 0, 0, 0);
        let b = encode_datetime(2023, 5, 1, 23, 59, 59, 0);
        let c = encode_datetime(2023, 5, 2, 0, 0, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_aux_column_shape() {
        let aux = JobColumn::new_aux(3001);
        assert!(aux.is_aux);
        assert_eq!(aux.width, 1);
        assert!(aux.default.is_some());
    }
}
