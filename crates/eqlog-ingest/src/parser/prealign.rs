//! Pre-align coordinate logs
//!
//! One reading per line: `Xmm 12.500 Ymm -3.250 Notch 0.010 Time 09-14-23 14:05:30`.
//! Coordinates are kept as exact decimals.

use chrono::NaiveDateTime;
use regex::Regex;
use sqlx::types::BigDecimal;
use std::str::FromStr;
use tracing::debug;

use eqlog_common::{EqlogError, Result};

use super::{non_blank, RowParser};
use crate::metadata::Metadata;
use crate::models::{CellValue, NormalizedRow};

const LINE_PATTERN: &str =
    r"(?i)^\s*Xmm\s+(?P<x>\S+)\s+Ymm\s+(?P<y>\S+)\s+Notch\s+(?P<notch>\S+)\s+Time\s+(?P<time>.+?)\s*$";

/// `MM-dd-yy HH:mm:ss`; chrono also accepts the unpadded `M-d-yy` form.
const PRIMARY_TIME_FORMAT: &str = "%m-%d-%y %H:%M:%S";

const FALLBACK_TIME_FORMATS: &[&str] = &[
    "%m-%d-%Y %H:%M:%S",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
];

pub fn parse_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    std::iter::once(PRIMARY_TIME_FORMAT)
        .chain(FALLBACK_TIME_FORMATS.iter().copied())
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Parser for pre-align readings.
#[derive(Debug, Clone)]
pub struct PreAlignParser {
    pattern: Regex,
}

impl PreAlignParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(LINE_PATTERN)
            .map_err(|e| EqlogError::Parse(format!("pre-align pattern: {e}")))?;
        Ok(Self { pattern })
    }

    fn parse_line(&self, eqpid: &CellValue, line: &str) -> Option<NormalizedRow> {
        let caps = self.pattern.captures(line)?;
        let decimal = |name: &str| {
            caps.name(name)
                .and_then(|m| BigDecimal::from_str(m.as_str()).ok())
        };

        let (Some(x), Some(y), Some(notch)) = (decimal("x"), decimal("y"), decimal("notch")) else {
            debug!(line, "Skipping pre-align line with non-numeric coordinate");
            return None;
        };
        let Some(datetime) = caps.name("time").and_then(|m| parse_time(m.as_str())) else {
            debug!(line, "Skipping pre-align line with unparsable time");
            return None;
        };

        Some(
            NormalizedRow::new()
                .with("eqpid", eqpid.clone())
                .with("datetime", datetime)
                .with("xmm", x)
                .with("ymm", y)
                .with("notch", notch),
        )
    }
}

impl RowParser for PreAlignParser {
    fn parse(&self, lines: &[&str], metadata: &Metadata) -> Result<Vec<NormalizedRow>> {
        let eqpid = CellValue::from_option(metadata.eqpid());
        Ok(non_blank(lines)
            .filter_map(|line| self.parse_line(&eqpid, line))
            .collect())
    }

    fn name(&self) -> &'static str {
        "pre_align"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn decimal(value: &str) -> CellValue {
        CellValue::Decimal(BigDecimal::from_str(value).unwrap())
    }

    fn parse(lines: &[&str]) -> Vec<NormalizedRow> {
        let mut metadata = Metadata::new();
        metadata.insert_if_absent("EqpId", "EQ-PA");
        PreAlignParser::new().unwrap().parse(lines, &metadata).unwrap()
    }

    #[test]
    fn test_reading() {
        let rows = parse(&["Xmm 12.500 Ymm -3.250 Notch 0.010 Time 09-14-23 14:05:30"]);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("eqpid"), Some(&CellValue::text("EQ-PA")));
        assert_eq!(row.get("xmm"), Some(&decimal("12.500")));
        assert_eq!(row.get("ymm"), Some(&decimal("-3.250")));
        assert_eq!(row.get("notch"), Some(&decimal("0.010")));
        assert_eq!(
            row.get("datetime"),
            Some(&CellValue::Timestamp(
                NaiveDate::from_ymd_opt(2023, 9, 14)
                    .unwrap()
                    .and_hms_opt(14, 5, 30)
                    .unwrap()
            ))
        );
    }

    #[test]
    fn test_case_and_whitespace_tolerant() {
        let rows = parse(&["  xmm   1.0\tYMM 2   notch 3 time 9-4-23 7:05:09  "]);
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("datetime").and_then(CellValue::as_timestamp),
            NaiveDate::from_ymd_opt(2023, 9, 4)
                .unwrap()
                .and_hms_opt(7, 5, 9)
        );
    }

    #[test]
    fn test_fallback_time_format() {
        assert!(parse_time("2023-09-14 14:05:30").is_some());
        assert!(parse_time("14:05:30").is_none());
    }

    #[test]
    fn test_bad_lines_skipped() {
        let rows = parse(&[
            "Xmm abc Ymm 1 Notch 2 Time 09-14-23 14:05:30",
            "Xmm 1 Ymm 1 Notch 2 Time whenever",
            "Pre-align log v2",
            "Xmm 1 Ymm 1 Notch 2 Time 09-14-23 14:05:31",
        ]);
        assert_eq!(rows.len(), 1);
    }
}
