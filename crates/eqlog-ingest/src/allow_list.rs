//! Allow-list of error identifiers
//!
//! Error rows are uploaded only when their id appears in a reference table.
//! The list is queried fresh for every file. When the query fails the filter
//! denies everything for that run rather than letting every row through.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, error};

use crate::models::NormalizedRow;
use crate::storage::{quote_ident, validate_table_name, DbResultExt};

pub const ERROR_ID_COLUMN: &str = "error_id";

/// Where permitted ids come from.
#[async_trait]
pub trait AllowListSource: Send + Sync {
    async fn load_ids(&self) -> Result<Vec<String>>;
}

/// Reads `error_id` from a reference table.
#[derive(Debug, Clone)]
pub struct PgAllowList {
    db: PgPool,
    table: String,
}

impl PgAllowList {
    pub fn new(db: PgPool, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }
}

#[async_trait]
impl AllowListSource for PgAllowList {
    async fn load_ids(&self) -> Result<Vec<String>> {
        validate_table_name(&self.table)?;
        let sql = format!("SELECT error_id FROM {}", quote_ident(&self.table));
        let ids: Vec<Option<String>> = sqlx::query_scalar(&sql)
            .fetch_all(&self.db)
            .await
            .db_context(|| format!("Failed to load allow-list from {}", self.table))?;
        Ok(ids.into_iter().flatten().collect())
    }
}

/// Case-insensitive set of permitted ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedIdSet {
    ids: HashSet<String>,
}

impl AllowedIdSet {
    fn key(id: &str) -> String {
        id.to_lowercase()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(&Self::key(id))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for AllowedIdSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter
                .into_iter()
                .map(|id| Self::key(id.as_ref()))
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }
}

/// Result of [`AllowListFilter::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub rows: Vec<NormalizedRow>,
    pub matched: usize,
    pub skipped: usize,
}

/// Filter built from one allow-list load.
#[derive(Debug, Clone)]
pub struct AllowListFilter {
    allowed: AllowedIdSet,
    degraded: bool,
}

impl AllowListFilter {
    pub fn new(allowed: AllowedIdSet) -> Self {
        Self {
            allowed,
            degraded: false,
        }
    }

    /// Load from `source`. A failed load yields a deny-all filter marked as
    /// degraded.
    pub async fn load(source: &dyn AllowListSource) -> Self {
        match source.load_ids().await {
            Ok(ids) => {
                let allowed: AllowedIdSet = ids.into_iter().collect();
                debug!(ids = allowed.len(), "Loaded error allow-list");
                Self::new(allowed)
            },
            Err(e) => {
                error!(
                    error = %format!("{e:#}"),
                    "Allow-list unavailable, no error rows will be uploaded for this file"
                );
                Self {
                    allowed: AllowedIdSet::default(),
                    degraded: true,
                }
            },
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn allowed(&self) -> &AllowedIdSet {
        &self.allowed
    }

    /// Keep the rows whose `id_column` text is in the allow-set.
    pub fn apply(&self, rows: Vec<NormalizedRow>, id_column: &str) -> FilterOutcome {
        let total = rows.len();
        let kept: Vec<NormalizedRow> = rows
            .into_iter()
            .filter(|row| {
                row.get(id_column)
                    .and_then(|value| value.as_str())
                    .is_some_and(|id| self.allowed.contains(id))
            })
            .collect();

        FilterOutcome {
            matched: kept.len(),
            skipped: total - kept.len(),
            rows: kept,
        }
    }
}
