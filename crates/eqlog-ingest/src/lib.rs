//! EQLog Ingest Library
//!
//! Ingests equipment log files into Postgres.
//!
//! # Supported Formats
//!
//! - **Wafer-flat**: metrology reports with a `Point#` measurement table
//! - **Error log**: error/event exports, filtered through an allow-list
//! - **Pre-align**: `Xmm/Ymm/Notch/Time` coordinate readings
//!
//! Each file goes through the same stages: a readiness gate that waits for
//! the writer to release the file, header metadata extraction, a
//! format-specific [`parser::RowParser`], timestamp reconciliation against
//! the server clock, and an idempotent upload.
//!
//! # Example
//!
//! ```no_run
//! use eqlog_ingest::config::IngestConfig;
//! use eqlog_ingest::parser::SourceFormat;
//! use eqlog_ingest::pipeline::Ingestor;
//! use sqlx::PgPool;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pool = PgPool::connect(&config.database.url).await?;
//!     let report = Ingestor::new(pool, config)
//!         .process_file(Path::new("/data/in/flat_001.csv"), SourceFormat::WaferFlat)
//!         .await;
//!     println!("{:?}", report.outcome);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod allow_list;
pub mod config;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod readiness;
pub mod storage;
pub mod time_sync;

pub use parser::{RowParser, SourceFormat};
pub use pipeline::{IngestOutcome, IngestReport, Ingestor};
