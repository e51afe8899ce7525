//! Row parsers for the three equipment log formats
//!
//! Every format implements [`RowParser`]; the caller picks the variant from
//! the [`SourceFormat`] of the file it is processing.

pub mod error_log;
pub mod prealign;
pub mod wafer_flat;

use serde::{Deserialize, Serialize};
use std::fmt;

use eqlog_common::Result;

use crate::metadata::{Metadata, MetadataExtractor};
use crate::models::NormalizedRow;
use crate::storage;

pub use error_log::ErrorLogParser;
pub use prealign::PreAlignParser;
pub use wafer_flat::{normalize_header, WaferFlatParser};

/// Converts body lines of one file into upload-ready rows.
pub trait RowParser: Send + Sync {
    /// Parse `lines` (the whole file, header lines included).
    ///
    /// Malformed lines are skipped; only a file-level problem such as a
    /// missing table header is an error.
    fn parse(&self, lines: &[&str], metadata: &Metadata) -> Result<Vec<NormalizedRow>>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// How a batch reaches its destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadProtocol {
    /// One transaction, one insert per row, conflicts ignored
    Transactional,
    /// Binary COPY; a unique violation means the batch was already loaded
    BulkCopy,
}

/// Input file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    WaferFlat,
    ErrorLog,
    PreAlign,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::WaferFlat => "wafer_flat",
            SourceFormat::ErrorLog => "error_log",
            SourceFormat::PreAlign => "pre_align",
        }
    }

    /// Destination table
    pub fn table(&self) -> &'static str {
        match self {
            SourceFormat::WaferFlat => storage::TABLE_WAFER_FLAT,
            SourceFormat::ErrorLog => storage::TABLE_ERROR,
            SourceFormat::PreAlign => storage::TABLE_PREALIGN,
        }
    }

    pub fn protocol(&self) -> UploadProtocol {
        match self {
            SourceFormat::WaferFlat | SourceFormat::PreAlign => UploadProtocol::Transactional,
            SourceFormat::ErrorLog => UploadProtocol::BulkCopy,
        }
    }

    /// Conflict clause appended to each transactional insert.
    pub fn conflict_clause(&self) -> &'static str {
        match self {
            SourceFormat::WaferFlat => "ON CONFLICT DO NOTHING",
            SourceFormat::PreAlign => "ON CONFLICT (eqpid, datetime) DO NOTHING",
            SourceFormat::ErrorLog => "",
        }
    }

    /// Columns of the destination table's unique key.
    pub fn natural_key(&self) -> &'static [&'static str] {
        match self {
            SourceFormat::WaferFlat => &["eqpid", "datetime", "lotid", "waferid", "point"],
            SourceFormat::ErrorLog => &["eqpid", "error_id", "time_stamp", "millisecond"],
            SourceFormat::PreAlign => &["eqpid", "datetime"],
        }
    }

    /// Column holding the equipment-local timestamp reconciled into `serv_ts`.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            SourceFormat::WaferFlat | SourceFormat::PreAlign => "datetime",
            SourceFormat::ErrorLog => "time_stamp",
        }
    }

    /// Whether rows pass through the allow-list before upload.
    pub fn uses_allow_list(&self) -> bool {
        matches!(self, SourceFormat::ErrorLog)
    }

    /// Header extractor for this format.
    pub fn metadata_extractor(&self, eqpid: &str) -> MetadataExtractor {
        match self {
            SourceFormat::ErrorLog => MetadataExtractor::error_log(eqpid),
            SourceFormat::WaferFlat | SourceFormat::PreAlign => MetadataExtractor::colon(),
        }
    }

    /// Row parser for this format.
    pub fn parser(&self) -> Result<Box<dyn RowParser>> {
        Ok(match self {
            SourceFormat::WaferFlat => Box::new(WaferFlatParser::new()),
            SourceFormat::ErrorLog => Box::new(ErrorLogParser::new()?),
            SourceFormat::PreAlign => Box::new(PreAlignParser::new()?),
        })
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blank lines, with `\r` already stripped by [`str::lines`].
pub(crate) fn non_blank<'a>(lines: &'a [&'a str]) -> impl Iterator<Item = &'a str> + 'a {
    lines.iter().copied().filter(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_routing() {
        assert_eq!(SourceFormat::WaferFlat.table(), "plg_wf_flat");
        assert_eq!(SourceFormat::ErrorLog.protocol(), UploadProtocol::BulkCopy);
        assert_eq!(SourceFormat::PreAlign.protocol(), UploadProtocol::Transactional);
        assert_eq!(SourceFormat::ErrorLog.timestamp_column(), "time_stamp");
        assert!(SourceFormat::ErrorLog.uses_allow_list());
        assert!(!SourceFormat::WaferFlat.uses_allow_list());
    }

    #[test]
    fn test_natural_key_includes_timestamp_column() {
        for format in [SourceFormat::WaferFlat, SourceFormat::ErrorLog, SourceFormat::PreAlign] {
            let key = format.natural_key();
            assert_eq!(key[0], "eqpid");
            assert!(key.contains(&format.timestamp_column()), "{format}");
        }
    }

    #[test]
    fn test_each_format_builds_a_parser() {
        for format in [SourceFormat::WaferFlat, SourceFormat::ErrorLog, SourceFormat::PreAlign] {
            assert!(format.parser().is_ok(), "{format}");
        }
    }
}
