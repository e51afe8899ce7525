//! Wafer-flat metrology reports
//!
//! ```text
//! Lot ID: LOT123
//! Wafer ID: LOT123-W07
//! Date and Time: 09/14/2023 14:05:30
//! Point#,Thickness (µm),GOF,X (mm),Y (mm),Die Row,Die Col
//! 1,0.5123,0.998,10.0,-5.0,3,4
//! ```
//!
//! Everything above the `Point#` line is header metadata. The table header
//! names are normalized into column names; each body line becomes one row
//! with the file metadata prepended.

use tracing::{debug, warn};

use eqlog_common::{EqlogError, Result};

use super::{non_blank, RowParser};
use crate::metadata::{
    Metadata, KEY_CASSETTE_RECIPE, KEY_FILM, KEY_LOT_ID, KEY_STAGE_GROUP, KEY_STAGE_RECIPE,
};
use crate::models::{CellValue, NormalizedRow};

const HEADER_MARKER: &str = "point#";

/// Columns stored as integers when the cell parses as one (compared
/// without underscores).
const INTEGER_COLUMNS: &[&str] = &["point", "dierow", "diecol", "dienum", "diepointtag"];

/// Metadata columns prepended to every row.
pub const FIXED_COLUMNS: &[&str] = &[
    "eqpid",
    "cassettercp",
    "stagercp",
    "stagegroup",
    "lotid",
    "waferid",
    "datetime",
    "film",
];

/// Normalize one table header cell into a column name.
///
/// `Thickness (µm)` becomes `thickness`, `Die X` becomes `diex`,
/// `GOF (no cal.)` becomes `gof_nocal`, `Point#` becomes `point`.
/// Normalizing an already normalized name returns it unchanged.
pub fn normalize_header(raw: &str) -> String {
    let mut text = raw.to_lowercase();
    for micro in ["(µm)", "(μm)"] {
        text = text.replace(micro, " ");
    }
    text.retain(|c| !matches!(c, '#' | '/' | ':' | '-' | 'µ' | 'μ'));

    loop {
        let next = text
            .replace("(no cal.)", " nocal ")
            .replace("(no cal)", " nocal ")
            .replace("(cal.)", " cal ")
            .replace("(cal)", " cal ")
            .replace("(mm)", " ")
            .replace("(um)", " ");
        if next == text {
            break;
        }
        text = next;
    }

    let mut tokens: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let merged = match (tokens.last().map(String::as_str), token) {
            (Some("no"), "cal" | "cal.") => Some("nocal"),
            (Some("die"), "x") => Some("diex"),
            (Some("die"), "y") => Some("diey"),
            _ => None,
        };
        match merged {
            Some(merged) => {
                if let Some(last) = tokens.last_mut() {
                    *last = merged.to_string();
                }
            },
            None => tokens.push(token.to_string()),
        }
    }

    tokens.join("_")
}

fn is_integer_column(name: &str) -> bool {
    let compact: String = name.chars().filter(|c| *c != '_').collect();
    INTEGER_COLUMNS.contains(&compact.as_str())
}

/// A mapped table column.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    index: usize,
    integer: bool,
}

struct ColumnMap {
    columns: Vec<Column>,
    /// Cells in the header line
    width: usize,
    /// Header names dropped because a metadata column has the same name
    shadowed: Vec<String>,
}

/// Parser for `Point#` tables.
#[derive(Debug, Clone, Default)]
pub struct WaferFlatParser;

impl WaferFlatParser {
    pub fn new() -> Self {
        Self
    }

    fn header_position(lines: &[&str]) -> Option<usize> {
        lines.iter().position(|line| {
            line.trim_start()
                .get(..HEADER_MARKER.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(HEADER_MARKER))
        })
    }

    /// Map normalized header names to cell indexes; the first occurrence of
    /// a name wins and names colliding with metadata columns are dropped.
    fn map_columns(header: &str) -> ColumnMap {
        let cells: Vec<&str> = header.split(',').collect();
        let mut columns: Vec<Column> = Vec::new();
        let mut shadowed = Vec::new();

        for (index, cell) in cells.iter().enumerate() {
            let name = normalize_header(cell);
            if name.is_empty() {
                continue;
            }
            if FIXED_COLUMNS.contains(&name.as_str()) {
                warn!(
                    column = %name,
                    header = cell.trim(),
                    "Table column shadows a metadata column, dropping its values"
                );
                shadowed.push(name);
                continue;
            }
            if columns.iter().any(|column| column.name == name) {
                continue;
            }
            columns.push(Column {
                integer: is_integer_column(&name),
                name,
                index,
            });
        }

        ColumnMap {
            columns,
            width: cells.len(),
            shadowed,
        }
    }

    fn metadata_row(metadata: &Metadata) -> NormalizedRow {
        let text = |key: &str| CellValue::from_option(metadata.get(key));
        NormalizedRow::new()
            .with("eqpid", CellValue::from_option(metadata.eqpid()))
            .with("cassettercp", text(KEY_CASSETTE_RECIPE))
            .with("stagercp", text(KEY_STAGE_RECIPE))
            .with("stagegroup", text(KEY_STAGE_GROUP))
            .with("lotid", text(KEY_LOT_ID))
            .with("waferid", CellValue::from_option(metadata.wafer_number()))
            .with("datetime", CellValue::from_option(metadata.report_datetime()))
            .with("film", text(KEY_FILM))
    }
}

impl RowParser for WaferFlatParser {
    fn parse(&self, lines: &[&str], metadata: &Metadata) -> Result<Vec<NormalizedRow>> {
        let header_index = Self::header_position(lines)
            .ok_or_else(|| EqlogError::MissingHeader("Point#".to_string()))?;
        let ColumnMap {
            columns,
            width: header_width,
            ..
        } = Self::map_columns(lines[header_index]);
        debug!(
            columns = columns.len(),
            header_width,
            "Mapped wafer-flat table header"
        );

        let base = Self::metadata_row(metadata);
        let mut rows = Vec::new();

        for (offset, line) in non_blank(&lines[header_index + 1..]).enumerate() {
            let cells: Vec<&str> = line.split(',').collect();
            if cells.len() < header_width {
                warn!(
                    line = header_index + offset + 2,
                    cells = cells.len(),
                    expected = header_width,
                    "Skipping line with insufficient columns"
                );
                continue;
            }

            let mut row = base.clone();
            for column in &columns {
                row.set(
                    column.name.clone(),
                    CellValue::classify(cells[column.index], column.integer),
                );
            }
            rows.push(row);
        }

        Ok(rows)
    }

    fn name(&self) -> &'static str {
        "wafer_flat"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metadata::MetadataExtractor;
    use chrono::NaiveDate;

    const REPORT: &str = "Lot ID: LOT123\n\
        Wafer ID: LOT123-W07\n\
        Date and Time: 09/14/2023 14:05:30\n\
        Film Name: OX1\n\
        \n\
        Point#,Thickness (µm),GOF,X (mm),Y (mm),Die Row,Die Col\n\
        1,0.5123,0.998,10.0,-5.0,3,4\n\
        \n\
        2,0.5120,0.997,12.5,-5.0,3,5\n\
        3,0.5119\n";

    fn parse(report: &str) -> Result<Vec<NormalizedRow>> {
        let lines: Vec<&str> = report.lines().collect();
        let mut metadata = MetadataExtractor::colon().extract(lines.iter().copied());
        metadata.insert_if_absent("EqpId", "EQ-01");
        WaferFlatParser::new().parse(&lines, &metadata)
    }

    #[test]
    fn test_normalize_header_cases() {
        assert_eq!(normalize_header("Point#"), "point");
        assert_eq!(normalize_header("Thickness (µm)"), "thickness");
        assert_eq!(normalize_header("X (mm)"), "x");
        assert_eq!(normalize_header("Die X"), "diex");
        assert_eq!(normalize_header("Die Point Tag"), "die_point_tag");
        assert_eq!(normalize_header("GOF (no cal.)"), "gof_nocal");
        assert_eq!(normalize_header("GOF No Cal"), "gof_nocal");
        assert_eq!(normalize_header("MSE (cal.)"), "mse_cal");
        assert_eq!(normalize_header("Pre-Thk / Post:Thk"), "prethk_postthk");
        assert_eq!(normalize_header("  "), "");
    }

    #[test]
    fn test_normalize_header_is_idempotent_on_samples() {
        for raw in ["Thickness (µm)", "GOF (no cal.)", "Die Y", "Site # / Zone"] {
            let once = normalize_header(raw);
            assert_eq!(normalize_header(&once), once);
        }
    }

    #[test]
    fn test_integer_columns() {
        assert!(is_integer_column("point"));
        assert!(is_integer_column("die_row"));
        assert!(is_integer_column("die_point_tag"));
        assert!(!is_integer_column("thickness"));
    }

    #[test]
    fn test_parse_report() {
        let rows = parse(REPORT).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.get("eqpid"), Some(&CellValue::text("EQ-01")));
        assert_eq!(first.get("lotid"), Some(&CellValue::text("LOT123")));
        assert_eq!(first.get("waferid"), Some(&CellValue::Integer(7)));
        assert_eq!(first.get("film"), Some(&CellValue::text("OX1")));
        assert_eq!(first.get("stagercp"), Some(&CellValue::Absent));
        assert_eq!(
            first.get("datetime"),
            Some(&CellValue::Timestamp(
                NaiveDate::from_ymd_opt(2023, 9, 14)
                    .unwrap()
                    .and_hms_opt(14, 5, 30)
                    .unwrap()
            ))
        );
        assert_eq!(first.get("point"), Some(&CellValue::Integer(1)));
        assert_eq!(first.get("thickness"), Some(&CellValue::Float(0.5123)));
        assert_eq!(first.get("die_row"), Some(&CellValue::Integer(3)));
        assert_eq!(first.get("x"), Some(&CellValue::Float(10.0)));

        let names: Vec<&str> = first.column_names().collect();
        assert_eq!(&names[..FIXED_COLUMNS.len()], FIXED_COLUMNS);
    }

    #[test]
    fn test_missing_header_fails_file() {
        let err = parse("Lot ID: LOT123\n1,2,3\n").unwrap_err();
        assert!(matches!(err, EqlogError::MissingHeader(_)));
    }

    #[test]
    fn test_duplicate_header_first_wins() {
        let rows = parse("point#,GOF,gof,Comment\n1,0.5,0.9,ok\n").unwrap();
        assert_eq!(rows[0].get("gof"), Some(&CellValue::Float(0.5)));
        assert_eq!(rows[0].get("comment"), Some(&CellValue::text("ok")));
    }

    #[test]
    fn test_metadata_named_columns_are_dropped() {
        let map = WaferFlatParser::map_columns("Point#,Film,EqpId,Thickness");
        assert_eq!(map.shadowed, vec!["film", "eqpid"]);
        let names: Vec<&str> = map.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["point", "thickness"]);
        assert_eq!(map.width, 4);

        let rows = parse("Film Name: OX1
Point#,Film,Thickness
1,NITRIDE,0.5
").unwrap();
        assert_eq!(rows[0].get("film"), Some(&CellValue::text("OX1")));
    }

    #[test]
    fn test_empty_cell_is_absent() {
        let rows = parse("Point#,MSE,Film\n1,,\n").unwrap();
        assert_eq!(rows[0].get("mse"), Some(&CellValue::Absent));
    }
}
