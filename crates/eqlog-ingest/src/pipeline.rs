//! Per-file ingestion pipeline
//!
//! `gate -> read -> metadata -> parse -> reconcile -> filter -> upload -> delete`
//!
//! Each call to [`Ingestor::process_file`] is self-contained: the server
//! clock and the allow-list are loaded fresh, the log scope is opened and
//! closed around the call, and nothing is cached between files. Failures
//! end up in the returned [`IngestReport`]; they never propagate.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, warn, Instrument};

use eqlog_common::logging::{LogConfig, LogScope};
use eqlog_common::EqlogError;

use crate::allow_list::{AllowListFilter, PgAllowList, ERROR_ID_COLUMN};
use crate::config::IngestConfig;
use crate::metadata::KEY_EQPID;
use crate::models::{EquipmentInfo, UploadBatch};
use crate::parser::SourceFormat;
use crate::readiness;
use crate::storage::equipment::sync_equipment_info;
use crate::storage::{PgEquipmentInfoStore, UploadCoordinator, UpsertOutcome};
use crate::time_sync::{self, truncate_to_seconds};

/// How one file ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Still locked by the writer; try again on the next trigger
    NotReady,
    /// Nothing was committed and the file is kept
    Failed { reason: String },
    /// The file parsed to zero rows; kept, nothing uploaded
    NoRows,
    Uploaded {
        rows: u64,
        /// Rows dropped by the allow-list
        skipped: usize,
        duplicate_batch: bool,
        source_deleted: bool,
    },
}

impl IngestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, IngestOutcome::Failed { .. })
    }
}

/// Result of [`Ingestor::process_file`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub path: PathBuf,
    pub format: SourceFormat,
    pub outcome: IngestOutcome,
    pub elapsed_ms: u64,
}

/// Runs the pipeline for individual files.
#[derive(Debug, Clone)]
pub struct Ingestor {
    pool: PgPool,
    config: IngestConfig,
    log_config: Option<LogConfig>,
}

impl Ingestor {
    pub fn new(pool: PgPool, config: IngestConfig) -> Self {
        Self {
            pool,
            config,
            log_config: None,
        }
    }

    /// Give every invocation its own log scope built from `log_config`.
    /// Without one, invocations log to the caller's current subscriber.
    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = Some(log_config);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn open_scope(&self) -> LogScope {
        let Some(log_config) = &self.log_config else {
            return LogScope::inherit();
        };
        let log_config = if self.config.debug {
            log_config.with_debug()
        } else {
            log_config.clone()
        };
        match LogScope::open(&log_config) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to open log scope, using current subscriber");
                LogScope::inherit()
            },
        }
    }

    /// Ingest one file. Never returns an error; see [`IngestOutcome`].
    pub async fn process_file(&self, path: &Path, format: SourceFormat) -> IngestReport {
        let started = Instant::now();
        let scope = self.open_scope();
        let span = tracing::dispatcher::with_default(scope.dispatch(), || {
            info_span!(
                "ingest",
                path = %path.display(),
                format = %format,
                eqpid = %self.config.eqpid
            )
        });

        let ingestor = self.clone();
        let owned_path = path.to_path_buf();
        let task = tokio::spawn(
            async move { ingestor.run(&owned_path, format).await }
                .instrument(span)
                .with_subscriber(scope.dispatch().clone()),
        );

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "ingestion panicked".to_string()
                } else {
                    format!("ingestion task failed: {join_error}")
                };
                tracing::dispatcher::with_default(scope.dispatch(), || {
                    error!(path = %path.display(), %reason, "Ingestion aborted");
                });
                IngestOutcome::Failed { reason }
            },
        };

        // Dropping the scope flushes the per-invocation file writer.
        drop(scope);

        IngestReport {
            path: path.to_path_buf(),
            format,
            outcome,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn run(&self, path: &Path, format: SourceFormat) -> IngestOutcome {
        match self.try_run(path, format).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format!("{e:#}");
                let transient = e
                    .downcast_ref::<EqlogError>()
                    .is_some_and(EqlogError::is_transient);
                error!(error = %reason, transient, "Ingestion failed, source file kept");
                IngestOutcome::Failed { reason }
            },
        }
    }

    async fn try_run(&self, path: &Path, format: SourceFormat) -> Result<IngestOutcome> {
        let eqpid = self.config.eqpid.as_str();

        let ready = readiness::wait_until_ready(path, &self.config.ready_policy())
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if !ready {
            return Ok(IngestOutcome::NotReady);
        }

        let text =
            readiness::read_all_text(path, self.config.encoding()?, self.config.read_timeout())
                .await?;
        let lines: Vec<&str> = text.lines().collect();

        let mut metadata = format
            .metadata_extractor(eqpid)
            .extract(lines.iter().copied());
        metadata.insert_if_absent(KEY_EQPID, eqpid);
        debug!(keys = metadata.len(), "Extracted header metadata");

        let parser = format.parser()?;
        let mut rows = parser
            .parse(&lines, &metadata)
            .with_context(|| format!("{} parser rejected {}", parser.name(), path.display()))?;
        if rows.is_empty() {
            info!(lines = lines.len(), "File produced no rows, nothing to upload");
            return Ok(IngestOutcome::NoRows);
        }

        let clock = time_sync::clock_for_invocation(&self.pool, &self.config.reference_tz).await;
        let reconciled = time_sync::reconcile(&mut rows, format.timestamp_column(), clock.as_ref());
        debug!(rows = rows.len(), reconciled, "Reconciled timestamps");

        let mut skipped = 0;
        let mut keep_source = false;
        if format.uses_allow_list() {
            let source = PgAllowList::new(self.pool.clone(), self.config.allow_list_table.clone());
            let filter = AllowListFilter::load(&source).await;
            let outcome = filter.apply(rows, ERROR_ID_COLUMN);
            info!(
                matched = outcome.matched,
                skipped = outcome.skipped,
                degraded = filter.is_degraded(),
                "Applied error allow-list"
            );
            skipped = outcome.skipped;
            keep_source = filter.is_degraded();
            rows = outcome.rows;
        }

        let batch = UploadBatch::new(format.table(), rows)?;
        let result = UploadCoordinator::new(self.pool.clone())
            .upload(format, &batch)
            .await?;

        let source_deleted = if self.config.delete_on_success && !keep_source {
            delete_source(path).await
        } else {
            false
        };

        Ok(IngestOutcome::Uploaded {
            rows: result.rows,
            skipped,
            duplicate_batch: result.duplicate_batch,
            source_deleted,
        })
    }

    /// Store `info` unless the stored descriptor is identical. `serv_ts` is
    /// derived from `info.date` through the server clock.
    pub async fn submit_equipment_info(&self, mut info: EquipmentInfo) -> Result<UpsertOutcome> {
        let clock = time_sync::clock_for_invocation(&self.pool, &self.config.reference_tz).await;
        info.serv_ts = Some(truncate_to_seconds(clock.to_synchronized_time(info.date)));

        let store = PgEquipmentInfoStore::new(self.pool.clone());
        sync_equipment_info(&store, &info).await
    }
}

async fn delete_source(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Deleted source file");
            true
        },
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Uploaded, but failed to delete source file");
            false
        },
    }
}
