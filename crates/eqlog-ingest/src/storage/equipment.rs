//! Change-aware upsert of the per-equipment descriptor

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};

use super::DbResultExt;
use crate::models::EquipmentInfo;

/// Storage of [`EquipmentInfo`] keyed by `eqpid`.
#[async_trait]
pub trait EquipmentInfoStore: Send + Sync {
    async fn fetch(&self, eqpid: &str) -> Result<Option<EquipmentInfo>>;

    async fn upsert(&self, info: &EquipmentInfo) -> Result<()>;
}

/// `eqp_info` table.
#[derive(Debug, Clone)]
pub struct PgEquipmentInfoStore {
    db: PgPool,
}

impl PgEquipmentInfoStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EquipmentInfoStore for PgEquipmentInfoStore {
    async fn fetch(&self, eqpid: &str) -> Result<Option<EquipmentInfo>> {
        let stored = sqlx::query_as::<_, EquipmentInfo>(
            r#"
            SELECT eqpid, name, model, serial, application, version, db_version, date, serv_ts
            FROM eqp_info
            WHERE eqpid = $1
            "#,
        )
        .bind(eqpid)
        .fetch_optional(&self.db)
        .await
        .db_context(|| format!("Failed to fetch equipment info for {eqpid}"))?;
        Ok(stored)
    }

    async fn upsert(&self, info: &EquipmentInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO eqp_info (
                eqpid, name, model, serial, application, version, db_version, date, serv_ts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (eqpid) DO UPDATE SET
                name = EXCLUDED.name,
                model = EXCLUDED.model,
                serial = EXCLUDED.serial,
                application = EXCLUDED.application,
                version = EXCLUDED.version,
                db_version = EXCLUDED.db_version,
                date = EXCLUDED.date,
                serv_ts = EXCLUDED.serv_ts
            "#,
        )
        .bind(&info.eqpid)
        .bind(&info.name)
        .bind(&info.model)
        .bind(&info.serial)
        .bind(&info.application)
        .bind(&info.version)
        .bind(&info.db_version)
        .bind(info.date)
        .bind(info.serv_ts)
        .execute(&self.db)
        .await
        .db_context(|| format!("Failed to upsert equipment info for {}", info.eqpid))?;
        Ok(())
    }
}

/// Whether [`sync_equipment_info`] wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Unchanged,
    Written,
}

/// Write `incoming` unless the stored descriptor is identical.
pub async fn sync_equipment_info(
    store: &dyn EquipmentInfoStore,
    incoming: &EquipmentInfo,
) -> Result<UpsertOutcome> {
    if let Some(stored) = store.fetch(&incoming.eqpid).await? {
        if stored.same_descriptor(incoming) {
            debug!(eqpid = %incoming.eqpid, "Equipment info unchanged, skipping write");
            return Ok(UpsertOutcome::Unchanged);
        }
    }

    store.upsert(incoming).await?;
    info!(eqpid = %incoming.eqpid, version = %incoming.version, "Equipment info updated");
    Ok(UpsertOutcome::Written)
}
