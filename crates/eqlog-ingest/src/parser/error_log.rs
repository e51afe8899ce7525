//! Error/event log exports
//!
//! Data lines look like
//! `E1001, 14-Sep-23 2:05:30 PM, LabelX, Something failed, 250, extra info`.
//! Anything that does not match the line grammar (header block, banners)
//! is skipped silently.

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::debug;

use eqlog_common::{EqlogError, Result};

use super::{non_blank, RowParser};
use crate::metadata::Metadata;
use crate::models::{CellValue, NormalizedRow};

const LINE_PATTERN: &str = r"^\s*(?P<id>\w+)\s*,\s*(?P<ts>[^,]+?)\s*,\s*(?P<label>[^,]*?)\s*,\s*(?P<desc>[^,]*?)\s*,\s*(?P<ms>\d+)\s*(?:,\s*(?P<extra>.*?))?\s*$";

/// `dd-MMM-yy h:mm:ss tt`
pub const TIMESTAMP_FORMAT: &str = "%d-%b-%y %I:%M:%S %p";

/// Fields captured from one data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLine<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub label: &'a str,
    pub description: &'a str,
    pub millisecond: &'a str,
    pub extra: Option<&'a str>,
}

impl ErrorLine<'_> {
    /// The five mandatory fields joined with commas.
    pub fn to_line(&self) -> String {
        [
            self.id,
            self.timestamp,
            self.label,
            self.description,
            self.millisecond,
        ]
        .join(",")
    }
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT).ok()
}

/// Parser for error log data lines.
#[derive(Debug, Clone)]
pub struct ErrorLogParser {
    pattern: Regex,
}

impl ErrorLogParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(LINE_PATTERN)
            .map_err(|e| EqlogError::Parse(format!("error log pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Match one line against the grammar.
    pub fn captures<'a>(&self, line: &'a str) -> Option<ErrorLine<'a>> {
        let caps = self.pattern.captures(line)?;
        let field = |name: &str| caps.name(name).map_or("", |m| m.as_str());
        Some(ErrorLine {
            id: field("id"),
            timestamp: field("ts"),
            label: field("label"),
            description: field("desc"),
            millisecond: field("ms"),
            extra: caps.name("extra").map(|m| m.as_str()),
        })
    }

    fn to_row(eqpid: &CellValue, line: &ErrorLine<'_>) -> NormalizedRow {
        let time_stamp = parse_timestamp(line.timestamp);
        if time_stamp.is_none() {
            debug!(error_id = line.id, timestamp = line.timestamp, "Unparsable error timestamp");
        }

        NormalizedRow::new()
            .with("eqpid", eqpid.clone())
            .with("error_id", line.id)
            .with("time_stamp", CellValue::from_option(time_stamp))
            .with("error_label", line.label)
            .with("error_desc", line.description)
            .with(
                "millisecond",
                CellValue::from_option(line.millisecond.parse::<i64>().ok()),
            )
            .with("extra_message_1", line.extra.unwrap_or(""))
            .with("extra_message_2", "")
    }
}

impl RowParser for ErrorLogParser {
    fn parse(&self, lines: &[&str], metadata: &Metadata) -> Result<Vec<NormalizedRow>> {
        let eqpid = CellValue::from_option(metadata.eqpid());
        let rows: Vec<NormalizedRow> = non_blank(lines)
            .filter_map(|line| self.captures(line))
            .map(|line| Self::to_row(&eqpid, &line))
            .collect();
        Ok(rows)
    }

    fn name(&self) -> &'static str {
        "error_log"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn metadata() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert_if_absent("EqpId", "EQ-01");
        metadata
    }

    #[test]
    fn test_line_with_extra() {
        let parser = ErrorLogParser::new().unwrap();
        let rows = parser
            .parse(
                &["E1001, 14-Sep-23 2:05:30 PM, LabelX, Something failed, 250, extra info"],
                &metadata(),
            )
            .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("eqpid"), Some(&CellValue::text("EQ-01")));
        assert_eq!(row.get("error_id"), Some(&CellValue::text("E1001")));
        assert_eq!(row.get("millisecond"), Some(&CellValue::Integer(250)));
        assert_eq!(row.get("extra_message_1"), Some(&CellValue::text("extra info")));
        assert_eq!(row.get("extra_message_2"), Some(&CellValue::text("")));
        assert_eq!(
            row.get("time_stamp"),
            Some(&CellValue::Timestamp(
                NaiveDate::from_ymd_opt(2023, 9, 14)
                    .unwrap()
                    .and_hms_opt(14, 5, 30)
                    .unwrap()
            ))
        );
    }

    #[test]
    fn test_line_without_extra() {
        let parser = ErrorLogParser::new().unwrap();
        let line = parser
            .captures("E2002,01-Jan-24 11:59:59 AM,Door,Door open,0")
            .unwrap();
        assert_eq!(line.extra, None);
        assert_eq!(line.label, "Door");
    }

    #[test]
    fn test_bad_timestamp_keeps_row() {
        let parser = ErrorLogParser::new().unwrap();
        let rows = parser
            .parse(&["E1, yesterday, L, D, 5"], &metadata())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("time_stamp"), Some(&CellValue::Absent));
    }

    #[test]
    fn test_non_matching_lines_skipped() {
        let parser = ErrorLogParser::new().unwrap();
        let lines = [
            "EXPORT_TYPE:, ERROR",
            "DATE:, 9/4/2023 7:05:09",
            "ID, Time, Label, Description, ms",
            "",
            "E1, 14-Sep-23 2:05:30 PM, L, D, 5",
        ];
        assert_eq!(parser.parse(&lines, &metadata()).unwrap().len(), 1);
    }

    #[test]
    fn test_to_line_matches_again() {
        let parser = ErrorLogParser::new().unwrap();
        let line = parser
            .captures("  E9 , 02-Feb-22 1:00:00 AM ,  , desc , 77 , a, b ")
            .unwrap();
        assert_eq!(line.extra, Some("a, b"));
        let rebuilt = line.to_line();
        assert_eq!(parser.captures(&rebuilt).unwrap().id, "E9");
    }
}
