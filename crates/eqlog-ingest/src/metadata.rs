//! Header metadata extraction
//!
//! Equipment reports start with `key: value` lines (`key:, value` in the
//! error export). Keys are matched case-insensitively and the first
//! occurrence of a key wins.

use chrono::NaiveDateTime;

pub const KEY_EQPID: &str = "EqpId";
pub const KEY_WAFER_ID: &str = "Wafer ID";
pub const KEY_DATE_AND_TIME: &str = "Date and Time";
pub const KEY_LOT_ID: &str = "Lot ID";
pub const KEY_CASSETTE_RECIPE: &str = "Cassette Recipe Name";
pub const KEY_STAGE_RECIPE: &str = "Stage Recipe Name";
pub const KEY_STAGE_GROUP: &str = "Stage Group Name";
pub const KEY_FILM: &str = "Film Name";

const KEY_DATE: &str = "DATE";
const KEY_EXPORT_TYPE: &str = "EXPORT_TYPE";

const ERROR_DATE_INPUT: &str = "%m/%d/%Y %H:%M:%S";
const ERROR_DATE_OUTPUT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats tried, in order, for the wafer-flat `Date and Time` header.
const REPORT_DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
];

/// Header layout of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    /// `key: value`
    Colon,
    /// `key:, value` (error export)
    ColonComma,
}

impl MetadataFormat {
    pub fn delimiter(&self) -> &'static str {
        match self {
            MetadataFormat::Colon => ":",
            MetadataFormat::ColonComma => ":,",
        }
    }
}

/// Header values of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert unless the key is already present. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Equipment id recorded in the file, if any.
    pub fn eqpid(&self) -> Option<&str> {
        self.get(KEY_EQPID)
    }

    /// Wafer number derived from the `Wafer ID` header.
    pub fn wafer_number(&self) -> Option<i32> {
        self.get(KEY_WAFER_ID).and_then(wafer_number)
    }

    /// Parsed `Date and Time` header; `None` if missing or unparsable.
    pub fn report_datetime(&self) -> Option<NaiveDateTime> {
        self.get(KEY_DATE_AND_TIME).and_then(parse_report_datetime)
    }
}

/// Splits header lines into [`Metadata`].
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    format: MetadataFormat,
    fallback_eqpid: Option<String>,
}

impl MetadataExtractor {
    /// Extractor for `key: value` headers (wafer-flat reports).
    pub fn colon() -> Self {
        Self {
            format: MetadataFormat::Colon,
            fallback_eqpid: None,
        }
    }

    /// Extractor for the error export: `key:, value` headers, `DATE`
    /// reformatting, `EXPORT_TYPE` dropped, and `eqpid` substituted when the
    /// file carries no `EqpId`.
    pub fn error_log(eqpid: impl Into<String>) -> Self {
        Self {
            format: MetadataFormat::ColonComma,
            fallback_eqpid: Some(eqpid.into()),
        }
    }

    pub fn format(&self) -> MetadataFormat {
        self.format
    }

    /// Split one line into a trimmed `(key, value)` pair.
    ///
    /// Lines without the delimiter, or starting with it, yield `None`.
    pub fn split_line<'a>(&self, line: &'a str) -> Option<(&'a str, &'a str)> {
        let delimiter = self.format.delimiter();
        let index = line.find(delimiter)?;
        if index == 0 {
            return None;
        }
        let key = line[..index].trim();
        if key.is_empty() {
            return None;
        }
        let value = line[index + delimiter.len()..].trim();
        Some((key, value))
    }

    pub fn extract<'a, I>(&self, lines: I) -> Metadata
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut metadata = Metadata::new();

        for line in lines {
            let Some((key, value)) = self.split_line(line) else {
                continue;
            };

            if self.format == MetadataFormat::ColonComma {
                if key.eq_ignore_ascii_case(KEY_EXPORT_TYPE) {
                    continue;
                }
                if key.eq_ignore_ascii_case(KEY_DATE) {
                    metadata.insert_if_absent(key, reformat_error_date(value));
                    continue;
                }
            }

            metadata.insert_if_absent(key, value);
        }

        if let Some(eqpid) = &self.fallback_eqpid {
            metadata.insert_if_absent(KEY_EQPID, eqpid.clone());
        }

        metadata
    }
}

/// Wafer number from a `Wafer ID` value such as `LOT123-W07`: the digits
/// after the first `W` that is followed by one.
pub fn wafer_number(wafer_id: &str) -> Option<i32> {
    let start = wafer_id.find(|c: char| c == 'W').map(|i| i + 1)?;
    let digits: String = wafer_id[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        // `W` not followed by digits; keep scanning after it
        return wafer_number(&wafer_id[start..]);
    }
    digits.parse().ok()
}

/// Parse the wafer-flat `Date and Time` header with fixed, locale-free formats.
pub fn parse_report_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    REPORT_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// `M/d/yyyy H:m:s` becomes `yyyy-MM-dd HH:mm:ss`; anything else is kept.
pub fn reformat_error_date(value: &str) -> String {
    match NaiveDateTime::parse_from_str(value.trim(), ERROR_DATE_INPUT) {
        Ok(parsed) => parsed.format(ERROR_DATE_OUTPUT).to_string(),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_colon_headers_first_occurrence_wins() {
        let extractor = MetadataExtractor::colon();
        let lines = [
            "Lot ID: LOT123",
            "Wafer ID: LOT123-W07",
            "lot id: OTHER",
            ": orphan value",
            "no delimiter here",
            "Date and Time: 09/14/2023 14:05:30",
        ];
        let metadata = extractor.extract(lines);

        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get("LOT ID"), Some("LOT123"));
        assert_eq!(metadata.wafer_number(), Some(7));
        assert_eq!(
            metadata.report_datetime(),
            NaiveDate::from_ymd_opt(2023, 9, 14)
                .unwrap()
                .and_hms_opt(14, 5, 30)
        );
    }

    #[test]
    fn test_value_keeps_later_colons() {
        let extractor = MetadataExtractor::colon();
        assert_eq!(
            extractor.split_line("  Date and Time :  9/1/2023 8:00:00 "),
            Some(("Date and Time", "9/1/2023 8:00:00"))
        );
    }

    #[test]
    fn test_unparsable_report_datetime_is_absent() {
        let extractor = MetadataExtractor::colon();
        let metadata = extractor.extract(["Date and Time: sometime tuesday"]);
        assert_eq!(metadata.get(KEY_DATE_AND_TIME), Some("sometime tuesday"));
        assert_eq!(metadata.report_datetime(), None);
    }

    #[test]
    fn test_error_log_headers() {
        let extractor = MetadataExtractor::error_log("EQ-CFG");
        let lines = [
            "EXPORT_TYPE:, ERROR",
            "DATE:, 9/4/2023 7:05:09",
            "MODEL:, ATLAS",
            "E1001, 14-Sep-23 2:05:30 PM, LabelX, Something failed, 250",
        ];
        let metadata = extractor.extract(lines);

        assert!(!metadata.contains_key("EXPORT_TYPE"));
        assert_eq!(metadata.get("DATE"), Some("2023-09-04 07:05:09"));
        assert_eq!(metadata.get("model"), Some("ATLAS"));
        assert_eq!(metadata.eqpid(), Some("EQ-CFG"));
    }

    #[test]
    fn test_error_log_keeps_file_eqpid() {
        let extractor = MetadataExtractor::error_log("EQ-CFG");
        let metadata = extractor.extract(["EqpId:, EQ-FILE"]);
        assert_eq!(metadata.eqpid(), Some("EQ-FILE"));
    }

    #[test]
    fn test_error_date_not_matching_is_kept() {
        assert_eq!(reformat_error_date("2023-09-04"), "2023-09-04");
    }

    #[test]
    fn test_wafer_number_variants() {
        assert_eq!(wafer_number("LOT123-W07"), Some(7));
        assert_eq!(wafer_number("WAFER-W12"), Some(12));
        assert_eq!(wafer_number("LOT123"), None);
        assert_eq!(wafer_number("LOT123-w07"), None);
    }
}
