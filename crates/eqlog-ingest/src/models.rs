//! Row and record types shared by the parsers and the upload layer

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;

use eqlog_common::{EqlogError, Result};

/// A typed cell value.
///
/// Text cells from the tabular format are classified into one of these by
/// [`CellValue::classify`]; the pattern formats build them directly.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Integer(i64),
    Float(f64),
    /// Exact decimal for coordinates that must not drift through `f64`
    Decimal(BigDecimal),
    Text(String),
    Timestamp(NaiveDateTime),
    Absent,
}

impl CellValue {
    /// Classify a raw cell.
    ///
    /// Empty cells are `Absent`. Integer-typed columns try `i64` first;
    /// every column then tries a finite `f64`; anything else stays text.
    pub fn classify(cell: &str, integer_column: bool) -> Self {
        let cell = cell.trim();
        if cell.is_empty() {
            return CellValue::Absent;
        }

        if integer_column {
            if let Ok(value) = cell.parse::<i64>() {
                return CellValue::Integer(value);
            }
        }

        match cell.parse::<f64>() {
            Ok(value) if value.is_finite() => CellValue::Float(value),
            _ => CellValue::Text(cell.to_string()),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    pub fn from_option<T: Into<CellValue>>(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Absent)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, CellValue::Absent)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            CellValue::Integer(_) => ColumnKind::Integer,
            CellValue::Float(_) => ColumnKind::Float,
            CellValue::Decimal(_) => ColumnKind::Decimal,
            CellValue::Text(_) => ColumnKind::Text,
            CellValue::Timestamp(_) => ColumnKind::Timestamp,
            CellValue::Absent => ColumnKind::Absent,
        }
    }

    /// Convert to the representation of `kind`.
    ///
    /// Numbers widen (`Integer` to `Float` or `Decimal`), anything goes to
    /// `Text` through its display form, and `Absent` stays absent.
    pub fn coerce(&self, kind: ColumnKind) -> CellValue {
        match (self, kind) {
            (CellValue::Absent, _) => CellValue::Absent,
            (CellValue::Integer(v), ColumnKind::Float) => CellValue::Float(*v as f64),
            (CellValue::Integer(v), ColumnKind::Decimal) => {
                CellValue::Decimal(BigDecimal::from(*v))
            },
            (CellValue::Float(v), ColumnKind::Decimal) => v
                .to_string()
                .parse::<BigDecimal>()
                .map(CellValue::Decimal)
                .unwrap_or(CellValue::Absent),
            (CellValue::Text(_), _) => self.clone(),
            (value, ColumnKind::Text) => CellValue::Text(value.to_string()),
            (value, _) => value.clone(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Decimal(v) => write!(f, "{v}"),
            CellValue::Text(v) => f.write_str(v),
            CellValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            CellValue::Absent => Ok(()),
        }
    }
}

/// Storage type shared by every cell of one batch column.
///
/// Statements bind one parameter type per column, so a column whose rows
/// carry different [`CellValue`] variants is widened to a common kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Decimal,
    Text,
    Timestamp,
    Absent,
}

impl ColumnKind {
    /// Narrowest kind that holds values of both `self` and `other`.
    pub fn unify(self, other: ColumnKind) -> ColumnKind {
        use ColumnKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Absent, kind) | (kind, Absent) => kind,
            (Integer, Float) | (Float, Integer) => Float,
            (Integer | Float, Decimal) | (Decimal, Integer | Float) => Decimal,
            _ => Text,
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Integer(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Integer(i64::from(value))
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<BigDecimal> for CellValue {
    fn from(value: BigDecimal) -> Self {
        CellValue::Decimal(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::Timestamp(value)
    }
}

/// One upload-ready record: column name to value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRow {
    columns: Vec<(String, CellValue)>,
}

impl NormalizedRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, replacing the value in place if it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<CellValue>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Rows bound for one destination table with one shared column list.
///
/// The column list is the union of every row's columns in first-seen order;
/// a row missing a column yields [`CellValue::Absent`] (written as `NULL`).
/// Each column also carries the [`ColumnKind`] unified over all rows.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    table: String,
    columns: Vec<String>,
    kinds: Vec<ColumnKind>,
    rows: Vec<NormalizedRow>,
}

static ABSENT: CellValue = CellValue::Absent;

impl UploadBatch {
    pub fn new(table: impl Into<String>, rows: Vec<NormalizedRow>) -> Result<Self> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(EqlogError::Config("Upload batch needs a table name".to_string()));
        }

        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for name in row.column_names() {
                if !columns.iter().any(|existing| existing == name) {
                    columns.push(name.to_string());
                }
            }
        }

        let kinds = columns
            .iter()
            .map(|column| {
                rows.iter()
                    .filter_map(|row| row.get(column))
                    .fold(ColumnKind::Absent, |kind, value| kind.unify(value.kind()))
            })
            .collect();

        Ok(Self {
            table,
            columns,
            kinds,
            rows,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[NormalizedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_kinds(&self) -> &[ColumnKind] {
        &self.kinds
    }

    /// Values of `row` in batch column order, coerced to each column's kind.
    pub fn values<'a>(&'a self, row: &'a NormalizedRow) -> impl Iterator<Item = CellValue> + 'a {
        self.columns
            .iter()
            .zip(&self.kinds)
            .map(move |(column, kind)| row.get(column).unwrap_or(&ABSENT).coerce(*kind))
    }

    /// Rows with the first occurrence of each `key_columns` tuple kept.
    ///
    /// Absent key cells compare equal to each other. An empty key keeps
    /// every row.
    pub fn distinct_rows(&self, key_columns: &[&str]) -> Vec<&NormalizedRow> {
        if key_columns.is_empty() {
            return self.rows.iter().collect();
        }
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|row| {
                let key: Vec<&CellValue> = key_columns
                    .iter()
                    .map(|column| row.get(column).unwrap_or(&ABSENT))
                    .collect();
                seen.insert(format!("{key:?}"))
            })
            .collect()
    }
}

/// Last-known descriptor of one piece of equipment, keyed by `eqpid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EquipmentInfo {
    pub eqpid: String,
    pub name: String,
    pub model: String,
    pub serial: String,
    pub application: String,
    pub version: String,
    pub db_version: String,
    pub date: NaiveDateTime,
    pub serv_ts: Option<NaiveDateTime>,
}

impl EquipmentInfo {
    /// Compare the descriptor fields only; timestamps are ignored.
    pub fn same_descriptor(&self, other: &EquipmentInfo) -> bool {
        self.eqpid == other.eqpid
            && self.name == other.name
            && self.model == other.model
            && self.serial == other.serial
            && self.application == other.application
            && self.version == other.version
            && self.db_version == other.db_version
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_classify_integer_column() {
        assert_eq!(CellValue::classify("12", true), CellValue::Integer(12));
        assert_eq!(CellValue::classify("-3", true), CellValue::Integer(-3));
        assert_eq!(CellValue::classify("1.5", true), CellValue::Float(1.5));
        assert_eq!(CellValue::classify("A1", true), CellValue::text("A1"));
    }

    #[test]
    fn test_classify_plain_column() {
        assert_eq!(CellValue::classify("12", false), CellValue::Float(12.0));
        assert_eq!(CellValue::classify(" 0.0253 ", false), CellValue::Float(0.0253));
        assert_eq!(CellValue::classify("1e-3", false), CellValue::Float(0.001));
        assert_eq!(CellValue::classify("NaN", false), CellValue::text("NaN"));
        assert_eq!(CellValue::classify("Pass", false), CellValue::text("Pass"));
    }

    #[test]
    fn test_classify_empty_is_absent() {
        assert!(CellValue::classify("", true).is_absent());
        assert!(CellValue::classify("   ", false).is_absent());
    }

    #[test]
    fn test_row_set_replaces_in_place() {
        let mut row = NormalizedRow::new().with("a", 1i64).with("b", "x");
        row.set("a", 2i64);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("a"), Some(&CellValue::Integer(2)));
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_batch_columns_are_union_in_first_seen_order() {
        let rows = vec![
            NormalizedRow::new().with("eqpid", "EQ1").with("x", 1.0),
            NormalizedRow::new().with("eqpid", "EQ1").with("y", 2.0),
        ];
        let batch = UploadBatch::new("plg_wf_flat", rows).unwrap();

        assert_eq!(batch.columns(), &["eqpid", "x", "y"]);
        let second: Vec<_> = batch.values(&batch.rows()[1]).collect();
        assert_eq!(
            second,
            vec![CellValue::text("EQ1"), CellValue::Absent, CellValue::Float(2.0)]
        );
    }

    #[test]
    fn test_mixed_numeric_column_widens_to_float() {
        // "3" and "3.0" in an integer-typed column
        let rows = vec![
            NormalizedRow::new()
                .with("point", 1i64)
                .with("die_row", CellValue::classify("3", true)),
            NormalizedRow::new()
                .with("point", 2i64)
                .with("die_row", CellValue::classify("3.0", true)),
            NormalizedRow::new().with("point", 3i64),
        ];
        let batch = UploadBatch::new("plg_wf_flat", rows).unwrap();

        assert_eq!(batch.column_kinds(), &[ColumnKind::Integer, ColumnKind::Float]);
        let die_rows: Vec<CellValue> = batch
            .rows()
            .iter()
            .map(|row| batch.values(row).nth(1).unwrap())
            .collect();
        assert_eq!(
            die_rows,
            vec![CellValue::Float(3.0), CellValue::Float(3.0), CellValue::Absent]
        );
    }

    #[test]
    fn test_text_in_numeric_column_widens_to_text() {
        let rows = vec![
            NormalizedRow::new().with("thickness", CellValue::classify("0.5", false)),
            NormalizedRow::new().with("thickness", CellValue::classify("N/A", false)),
        ];
        let batch = UploadBatch::new("plg_wf_flat", rows).unwrap();

        assert_eq!(batch.column_kinds(), &[ColumnKind::Text]);
        let values: Vec<CellValue> = batch
            .rows()
            .iter()
            .flat_map(|row| batch.values(row))
            .collect();
        assert_eq!(values, vec![CellValue::text("0.5"), CellValue::text("N/A")]);
    }

    #[test]
    fn test_unify_kinds() {
        use ColumnKind::*;
        assert_eq!(Integer.unify(Integer), Integer);
        assert_eq!(Absent.unify(Timestamp), Timestamp);
        assert_eq!(Float.unify(Integer), Float);
        assert_eq!(Decimal.unify(Float), Decimal);
        assert_eq!(Timestamp.unify(Integer), Text);
        assert_eq!(Text.unify(Float), Text);
    }

    #[test]
    fn test_coerce_integer_to_decimal() {
        assert_eq!(
            CellValue::Integer(12).coerce(ColumnKind::Decimal),
            CellValue::Decimal(BigDecimal::from(12))
        );
        assert_eq!(
            CellValue::Float(0.25).coerce(ColumnKind::Decimal),
            CellValue::Decimal("0.25".parse().unwrap())
        );
    }

    #[test]
    fn test_distinct_rows_keeps_first_occurrence() {
        let ts = NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();
        let line = |id: &str, ms: i64, label: &str| {
            NormalizedRow::new()
                .with("error_id", id)
                .with("time_stamp", ts)
                .with("millisecond", ms)
                .with("error_label", label)
        };
        let rows = vec![
            line("E1", 5, "first"),
            line("E1", 5, "again"),
            line("E2", 7, "other"),
        ];
        let batch = UploadBatch::new("plg_error", rows).unwrap();

        let distinct = batch.distinct_rows(&["error_id", "time_stamp", "millisecond"]);
        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct[0].get("error_label"), Some(&CellValue::text("first")));
        assert_eq!(distinct[1].get("error_id"), Some(&CellValue::text("E2")));

        assert_eq!(batch.distinct_rows(&[]).len(), 3);
    }

    #[test]
    fn test_distinct_rows_absent_keys_are_equal() {
        let rows = vec![
            NormalizedRow::new()
                .with("error_id", "E1")
                .with("time_stamp", CellValue::Absent),
            NormalizedRow::new().with("error_id", "E1"),
        ];
        let batch = UploadBatch::new("plg_error", rows).unwrap();
        assert_eq!(batch.distinct_rows(&["error_id", "time_stamp"]).len(), 1);
    }

    #[test]
    fn test_batch_requires_table() {
        assert!(UploadBatch::new(" ", Vec::new()).is_err());
    }

    #[test]
    fn test_same_descriptor_ignores_timestamps() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let stored = EquipmentInfo {
            eqpid: "EQ1".into(),
            name: "THK-01".into(),
            model: "ATLAS".into(),
            serial: "SN-1".into(),
            application: "flat".into(),
            version: "2.1".into(),
            db_version: "7".into(),
            date,
            serv_ts: None,
        };
        let mut incoming = stored.clone();
        incoming.date = date + chrono::Duration::hours(1);
        incoming.serv_ts = Some(date);
        assert!(stored.same_descriptor(&incoming));

        incoming.version = "2.2".into();
        assert!(!stored.same_descriptor(&incoming));
    }
}
