//! Upload coordinator
//!
//! Persists an [`UploadBatch`] with the protocol its source format calls
//! for. Duplicate rows are never an error: the transactional path relies on
//! `ON CONFLICT` clauses and the bulk path treats a unique violation as
//! "already ingested".

pub mod batch;
pub mod copy;
pub mod equipment;

use std::fmt::Display;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

use eqlog_common::{EqlogError, Result as EqlogResult};

use crate::models::UploadBatch;
use crate::parser::{SourceFormat, UploadProtocol};

pub use copy::CopyOutcome;
pub use equipment::{EquipmentInfoStore, PgEquipmentInfoStore, UpsertOutcome};

pub const TABLE_WAFER_FLAT: &str = "plg_wf_flat";
pub const TABLE_ERROR: &str = "plg_error";
pub const TABLE_PREALIGN: &str = "plg_prealign";
pub const TABLE_EQUIPMENT_INFO: &str = "eqp_info";
pub const TABLE_ALLOW_LIST: &str = "err_severity_map";

/// Double-quote an identifier, doubling embedded quotes. Dotted names are
/// quoted per part so `schema.table` keeps working.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified.
pub fn validate_table_name(name: &str) -> EqlogResult<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(EqlogError::Config(format!("Invalid table name: {name:?}")))
    }
}

/// Quote a column name as a single identifier; header-derived names may
/// contain dots or parentheses.
pub fn quote_column(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Classify a sqlx failure: lost or unreachable connections become
/// [`EqlogError::Connection`], everything else [`EqlogError::Database`].
pub fn database_error(context: impl Display, err: &sqlx::Error) -> EqlogError {
    let message = format!("{context}: {err}");
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EqlogError::Connection(message),
        _ => EqlogError::Database(message),
    }
}

/// `with_context` for sqlx results that keeps the error typed.
pub trait DbResultExt<T> {
    fn db_context<C, F>(self, context: F) -> EqlogResult<T>
    where
        C: Display,
        F: FnOnce() -> C;
}

impl<T> DbResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn db_context<C, F>(self, context: F) -> EqlogResult<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|err| database_error(context(), &err))
    }
}

/// What an upload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// Rows that reached storage (conflicting rows count as zero)
    pub rows: u64,
    /// The bulk load hit a unique violation: the batch was already stored
    pub duplicate_batch: bool,
}

/// Routes batches to the transactional or bulk protocol.
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    db: PgPool,
}

impl UploadCoordinator {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Upload `batch` for `format`. Any error means nothing from the batch
    /// was committed.
    pub async fn upload(&self, format: SourceFormat, batch: &UploadBatch) -> Result<UploadResult> {
        if batch.is_empty() {
            return Ok(UploadResult {
                rows: 0,
                duplicate_batch: false,
            });
        }

        let result = match format.protocol() {
            UploadProtocol::Transactional => {
                let rows = batch::insert_rows(&self.db, batch, format.conflict_clause()).await?;
                UploadResult {
                    rows,
                    duplicate_batch: false,
                }
            },
            UploadProtocol::BulkCopy => {
                match copy::copy_rows(&self.db, batch, format.natural_key()).await? {
                    CopyOutcome::Copied(rows) => UploadResult {
                        rows,
                        duplicate_batch: false,
                    },
                    CopyOutcome::DuplicateBatch => UploadResult {
                        rows: 0,
                        duplicate_batch: true,
                    },
                }
            },
        };

        info!(
            table = batch.table(),
            submitted = batch.len(),
            stored = result.rows,
            duplicate_batch = result.duplicate_batch,
            "Uploaded batch"
        );
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("plg_error"), "\"plg_error\"");
        assert_eq!(quote_ident("public.eqp_info"), "\"public\".\"eqp_info\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("err_severity_map").is_ok());
        assert!(validate_table_name("ref.err_severity_map").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("x; DROP TABLE y").is_err());
        assert!(validate_table_name("a..b").is_err());
    }

    #[test]
    fn test_database_error_classification() {
        let lost = database_error("Failed to begin", &sqlx::Error::PoolTimedOut);
        assert!(matches!(lost, EqlogError::Connection(_)));
        assert!(lost.is_transient());
        assert!(lost.to_string().contains("Failed to begin"));

        let rejected = database_error("Failed to insert", &sqlx::Error::RowNotFound);
        assert!(matches!(rejected, EqlogError::Database(_)));
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_db_context_is_lazy_on_success() {
        let ok: std::result::Result<u8, sqlx::Error> = Ok(3);
        assert_eq!(ok.db_context(|| -> String { unreachable!() }).unwrap(), 3);
    }

    #[test]
    fn test_quote_column_keeps_dots() {
        assert_eq!(quote_column("thk_1.5"), "\"thk_1.5\"");
    }
}
