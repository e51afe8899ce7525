//! Equipment-local to reference time reconciliation
//!
//! Every row carrying a local timestamp gets a `serv_ts` column: the
//! timestamp translated by a [`TimeSync`] and truncated to whole seconds.

use anyhow::Result;
use chrono::{Duration, Local, NaiveDateTime, SubsecRound};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::models::{CellValue, NormalizedRow};
use crate::storage::DbResultExt;

pub const SERV_TS_COLUMN: &str = "serv_ts";

/// Converts an equipment-local timestamp into the reference time domain.
pub trait TimeSync: Send + Sync {
    fn to_synchronized_time(&self, local: NaiveDateTime) -> NaiveDateTime;
}

/// Constant offset from local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedOffsetClock {
    offset: Duration,
}

impl FixedOffsetClock {
    pub fn new(offset: Duration) -> Self {
        Self { offset }
    }

    /// Local time taken as reference time.
    pub fn identity() -> Self {
        Self::new(Duration::zero())
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }
}

impl TimeSync for FixedOffsetClock {
    fn to_synchronized_time(&self, local: NaiveDateTime) -> NaiveDateTime {
        local + self.offset
    }
}

/// Offset between this host's clock and the database clock, read as wall
/// time in the reference time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerClock {
    time_zone: String,
    offset: Duration,
}

impl ServerClock {
    /// Measure the offset once. The local reading is the midpoint of the
    /// round trip.
    pub async fn measure(pool: &PgPool, time_zone: &str) -> Result<Self> {
        let before = Local::now().naive_local();
        let server: NaiveDateTime = sqlx::query_scalar("SELECT (now() AT TIME ZONE $1)::timestamp")
            .bind(time_zone)
            .fetch_one(pool)
            .await
            .db_context(|| format!("Failed to read server clock in {time_zone}"))?;
        let after = Local::now().naive_local();

        let midpoint = before + (after - before) / 2;
        let offset = server - midpoint;
        debug!(
            time_zone,
            offset_ms = offset.num_milliseconds(),
            "Measured server clock offset"
        );

        Ok(Self {
            time_zone: time_zone.to_string(),
            offset,
        })
    }

    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }
}

impl TimeSync for ServerClock {
    fn to_synchronized_time(&self, local: NaiveDateTime) -> NaiveDateTime {
        local + self.offset
    }
}

/// Measure the server clock, or fall back to local time when the database
/// cannot be asked.
pub async fn clock_for_invocation(pool: &PgPool, time_zone: &str) -> Box<dyn TimeSync> {
    match ServerClock::measure(pool, time_zone).await {
        Ok(clock) => Box::new(clock),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Server clock unavailable, using local time");
            Box::new(FixedOffsetClock::identity())
        },
    }
}

pub fn truncate_to_seconds(value: NaiveDateTime) -> NaiveDateTime {
    value.trunc_subsecs(0)
}

/// Set `serv_ts` on every row from its `timestamp_column`.
///
/// Rows without a local timestamp get an absent `serv_ts`. Returns the
/// number of rows that received a reconciled timestamp.
pub fn reconcile(rows: &mut [NormalizedRow], timestamp_column: &str, clock: &dyn TimeSync) -> usize {
    let mut reconciled = 0;
    for row in rows.iter_mut() {
        let local = row.get(timestamp_column).and_then(CellValue::as_timestamp);
        let serv_ts = local.map(|local| truncate_to_seconds(clock.to_synchronized_time(local)));
        if serv_ts.is_some() {
            reconciled += 1;
        }
        row.set(SERV_TS_COLUMN, CellValue::from_option(serv_ts));
    }
    reconciled
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, milli: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_milli_opt(h, m, s, milli)
            .unwrap()
    }

    #[test]
    fn test_truncate_drops_subseconds() {
        assert_eq!(truncate_to_seconds(at(14, 5, 30, 999)), at(14, 5, 30, 0));
    }

    #[test]
    fn test_reconcile_applies_offset_and_truncates() {
        let clock = FixedOffsetClock::new(Duration::milliseconds(1_700));
        let mut rows = vec![
            NormalizedRow::new().with("datetime", at(14, 5, 30, 0)),
            NormalizedRow::new().with("datetime", CellValue::Absent),
            NormalizedRow::new(),
        ];

        assert_eq!(reconcile(&mut rows, "datetime", &clock), 1);
        assert_eq!(
            rows[0].get(SERV_TS_COLUMN),
            Some(&CellValue::Timestamp(at(14, 5, 31, 0)))
        );
        assert_eq!(rows[1].get(SERV_TS_COLUMN), Some(&CellValue::Absent));
        assert_eq!(rows[2].get(SERV_TS_COLUMN), Some(&CellValue::Absent));
    }

    #[test]
    fn test_identity_clock() {
        let clock = FixedOffsetClock::identity();
        assert_eq!(clock.to_synchronized_time(at(1, 2, 3, 4)), at(1, 2, 3, 4));
    }
}
