//! Binary `COPY ... FROM STDIN` upload
//!
//! The batch is encoded in the PostgreSQL binary copy format and streamed
//! in chunks. Rows repeating a natural key inside the batch are dropped
//! before encoding, so a unique violation reported by the server means the
//! batch was already ingested and is not an error.

use anyhow::Result;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::PgPool;
use tracing::{debug, warn};

use eqlog_common::{EqlogError, Result as EqlogResult};

use super::{database_error, quote_column, quote_ident, validate_table_name, DbResultExt};
use crate::models::{CellValue, NormalizedRow, UploadBatch};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800 * 1_000_000;

/// Rows per chunk sent over the copy channel
pub const COPY_CHUNK_ROWS: usize = 1_000;

/// Result of [`copy_rows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(u64),
    DuplicateBatch,
}

/// Builds a binary copy payload.
#[derive(Debug)]
pub struct BinaryCopyEncoder {
    buf: Vec<u8>,
    columns: usize,
}

impl BinaryCopyEncoder {
    /// Start a payload for rows of `columns` fields.
    pub fn new(columns: usize) -> Self {
        let mut buf = Vec::with_capacity(64 * 1024);
        buf.extend_from_slice(SIGNATURE);
        buf.extend_from_slice(&0i32.to_be_bytes()); // flags
        buf.extend_from_slice(&0i32.to_be_bytes()); // header extension length
        Self { buf, columns }
    }

    pub fn push_row<I>(&mut self, values: I) -> EqlogResult<()>
    where
        I: IntoIterator<Item = CellValue>,
    {
        let values: Vec<CellValue> = values.into_iter().collect();
        if values.len() != self.columns {
            return Err(EqlogError::Parse(format!(
                "Row has {} fields, expected {}",
                values.len(),
                self.columns
            )));
        }
        let count = i16::try_from(self.columns)
            .map_err(|_| EqlogError::Parse(format!("Too many columns: {}", self.columns)))?;
        self.buf.extend_from_slice(&count.to_be_bytes());

        for value in &values {
            self.push_field(value)?;
        }
        Ok(())
    }

    fn push_field(&mut self, value: &CellValue) -> EqlogResult<()> {
        match value {
            CellValue::Absent => self.buf.extend_from_slice(&(-1i32).to_be_bytes()),
            CellValue::Integer(v) => self.push_bytes(&v.to_be_bytes())?,
            CellValue::Float(v) => self.push_bytes(&v.to_be_bytes())?,
            CellValue::Text(v) => self.push_bytes(v.as_bytes())?,
            CellValue::Timestamp(v) => {
                let micros = v.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS;
                self.push_bytes(&micros.to_be_bytes())?;
            },
            CellValue::Decimal(v) => {
                return Err(EqlogError::Parse(format!(
                    "Decimal value {v} cannot be sent through binary COPY"
                )))
            },
        }
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> EqlogResult<()> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| EqlogError::Parse(format!("Field too large: {} bytes", bytes.len())))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Take the bytes encoded so far, leaving the encoder ready for more rows.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Append the trailer and return the remaining bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&(-1i16).to_be_bytes());
        self.buf
    }
}

pub fn copy_statement(batch: &UploadBatch) -> String {
    let columns = batch
        .columns()
        .iter()
        .map(|column| quote_column(column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        quote_ident(batch.table()),
        columns
    )
}

/// Encode `rows` of `batch` into payload chunks of [`COPY_CHUNK_ROWS`] rows.
pub fn encode_chunks(
    batch: &UploadBatch,
    rows: &[&NormalizedRow],
) -> EqlogResult<Vec<Vec<u8>>> {
    let mut encoder = BinaryCopyEncoder::new(batch.columns().len());
    let mut chunks = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        encoder.push_row(batch.values(row))?;
        if (index + 1) % COPY_CHUNK_ROWS == 0 {
            chunks.push(encoder.take());
        }
    }
    chunks.push(encoder.finish());
    Ok(chunks)
}

fn duplicate_or_error(err: sqlx::Error, table: &str) -> Result<CopyOutcome> {
    let duplicate = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if duplicate {
        warn!(table, error = %err, "Batch already ingested, skipping duplicate COPY");
        return Ok(CopyOutcome::DuplicateBatch);
    }
    Err(database_error(format!("COPY into {table} failed"), &err).into())
}

/// Stream `batch` into its table with binary COPY.
///
/// Only the first row of each `key_columns` tuple is sent.
pub async fn copy_rows(
    db: &PgPool,
    batch: &UploadBatch,
    key_columns: &[&str],
) -> Result<CopyOutcome> {
    validate_table_name(batch.table())?;
    let rows = batch.distinct_rows(key_columns);
    if rows.len() < batch.len() {
        warn!(
            table = batch.table(),
            dropped = batch.len() - rows.len(),
            "Dropping rows that repeat a key within the batch"
        );
    }
    let chunks = encode_chunks(batch, &rows)?;
    let statement = copy_statement(batch);

    let mut copy = db
        .copy_in_raw(&statement)
        .await
        .db_context(|| format!("Failed to start COPY into {}", batch.table()))?;

    for chunk in chunks {
        if let Err(e) = copy.send(chunk).await {
            return duplicate_or_error(e, batch.table());
        }
    }

    match copy.finish().await {
        Ok(rows) => {
            debug!(table = batch.table(), rows, "COPY finished");
            Ok(CopyOutcome::Copied(rows))
        },
        Err(e) => duplicate_or_error(e, batch.table()),
    }
}
