//! Transactional row-by-row insert

use anyhow::Result;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};

use super::{quote_column, quote_ident, validate_table_name, DbResultExt};
use crate::models::{CellValue, UploadBatch};

/// Insert every row of `batch` inside one transaction.
///
/// Each row is its own `INSERT ... <conflict_clause>` so the returned count
/// only includes rows that were actually written. On any failure the whole
/// transaction is rolled back.
///
/// Cells are bound with their column's unified kind and statements are not
/// cached, so rows with differently typed cells never share a prepared
/// statement.
pub async fn insert_rows(db: &PgPool, batch: &UploadBatch, conflict_clause: &str) -> Result<u64> {
    validate_table_name(batch.table())?;

    let mut tx = db
        .begin()
        .await
        .db_context(|| "Failed to begin upload transaction")?;

    match insert_all(&mut tx, batch, conflict_clause).await {
        Ok(affected) => {
            tx.commit()
                .await
                .db_context(|| format!("Failed to commit upload into {}", batch.table()))?;
            Ok(affected)
        },
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, table = batch.table(), "Rollback failed");
            }
            Err(e)
        },
    }
}

async fn insert_all(
    tx: &mut Transaction<'_, Postgres>,
    batch: &UploadBatch,
    conflict_clause: &str,
) -> Result<u64> {
    let prefix = insert_prefix(batch);
    let mut affected = 0u64;

    for (index, row) in batch.rows().iter().enumerate() {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
        query_builder.push_values(std::iter::once(row), |mut b, row| {
            for value in batch.values(row) {
                push_cell(&mut b, value);
            }
        });
        if !conflict_clause.is_empty() {
            query_builder.push(" ");
            query_builder.push(conflict_clause);
        }

        let result = query_builder
            .build()
            .persistent(false)
            .execute(&mut **tx)
            .await
            .db_context(|| format!("Failed to insert row {} into {}", index + 1, batch.table()))?;
        affected += result.rows_affected();
    }

    debug!(
        table = batch.table(),
        rows = batch.len(),
        affected,
        "Inserted batch rows"
    );
    Ok(affected)
}

fn insert_prefix(batch: &UploadBatch) -> String {
    let columns = batch
        .columns()
        .iter()
        .map(|column| quote_column(column))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) ", quote_ident(batch.table()), columns)
}

fn push_cell(b: &mut Separated<'_, '_, Postgres, &'static str>, value: CellValue) {
    match value {
        CellValue::Integer(v) => {
            b.push_bind(v);
        },
        CellValue::Float(v) => {
            b.push_bind(v);
        },
        CellValue::Decimal(v) => {
            b.push_bind(v);
        },
        CellValue::Text(v) => {
            b.push_bind(v);
        },
        CellValue::Timestamp(v) => {
            b.push_bind(v);
        },
        CellValue::Absent => {
            b.push("NULL");
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::NormalizedRow;

    #[test]
    fn test_insert_prefix_quotes_columns() {
        let batch = UploadBatch::new(
            "plg_wf_flat",
            vec![NormalizedRow::new().with("eqpid", "EQ1").with("thk_1.5", 1.0)],
        )
        .unwrap();
        assert_eq!(
            insert_prefix(&batch),
            "INSERT INTO \"plg_wf_flat\" (\"eqpid\", \"thk_1.5\") "
        );
    }
}
