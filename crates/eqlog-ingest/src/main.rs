//! EQLog Ingest - equipment log ingestion tool

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use eqlog_common::logging::{init_logging, LogConfig, LogLevel};
use eqlog_ingest::config::{IngestConfig, DEFAULT_DATABASE_URL};
use eqlog_ingest::models::EquipmentInfo;
use eqlog_ingest::parser::SourceFormat;
use eqlog_ingest::pipeline::{IngestOutcome, Ingestor};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "eqlog-ingest")]
#[command(author, version, about = "Equipment log ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the result as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Ingest a wafer-flat metrology report
    WaferFlat {
        /// Report file
        path: PathBuf,
    },

    /// Ingest an error/event log export
    ErrorLog {
        /// Log file
        path: PathBuf,
    },

    /// Ingest a pre-align coordinate log
    PreAlign {
        /// Log file
        path: PathBuf,
    },

    /// Store this equipment's descriptor if it changed
    EqpInfo {
        #[arg(long, env = "EQLOG_EQP_NAME")]
        name: String,

        #[arg(long, env = "EQLOG_EQP_MODEL")]
        model: String,

        #[arg(long, env = "EQLOG_EQP_SERIAL")]
        serial: String,

        #[arg(long, env = "EQLOG_EQP_APPLICATION")]
        application: String,

        #[arg(long, env = "EQLOG_EQP_VERSION")]
        sw_version: String,

        #[arg(long, env = "EQLOG_EQP_DB_VERSION")]
        db_version: String,
    },

    /// Apply database migrations
    Migrate,
}

impl Command {
    fn source_format(&self) -> Option<(SourceFormat, &PathBuf)> {
        match self {
            Command::WaferFlat { path } => Some((SourceFormat::WaferFlat, path)),
            Command::ErrorLog { path } => Some((SourceFormat::ErrorLog, path)),
            Command::PreAlign { path } => Some((SourceFormat::PreAlign, path)),
            Command::EqpInfo { .. } | Command::Migrate => None,
        }
    }
}

async fn connect(url: &str, max_connections: u32, connect_timeout_secs: u64) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(connect_timeout_secs))
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");
    Ok(pool)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match cli.command {
        Command::Migrate => None,
        _ => Some(IngestConfig::from_env()?),
    };
    let debug = cli.verbose || config.as_ref().is_some_and(|c| c.debug);

    let log_config = LogConfig::builder()
        .level(if debug { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("eqlog-ingest")
        .build()
        .merge_env()?;
    let log_config = if debug {
        log_config.with_debug()
    } else {
        log_config
    };

    // File output is opened per ingested file; the process-wide subscriber
    // only writes to the console.
    let _guard = init_logging(&log_config.console_only())?;

    let Some(config) = config else {
        dotenvy::dotenv().ok();
        let url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let pool = connect(&url, 1, 10).await?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        info!("Database migrations completed");
        return Ok(ExitCode::SUCCESS);
    };

    let pool = connect(
        &config.database.url,
        config.database.max_connections,
        config.database.connect_timeout_secs,
    )
    .await?;

    let mut ingestor = Ingestor::new(pool, config.clone());
    if log_config.output.writes_file() {
        ingestor = ingestor.with_log_config(log_config.clone());
    }

    if let Some((format, path)) = cli.command.source_format() {
        let report = ingestor.process_file(path, format).await;
        if cli.json {
            print_json(&report)?;
        } else {
            info!(outcome = ?report.outcome, elapsed_ms = report.elapsed_ms, "Ingestion complete");
        }
        return Ok(match report.outcome {
            IngestOutcome::Failed { .. } => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        });
    }

    if let Command::EqpInfo {
        name,
        model,
        serial,
        application,
        sw_version,
        db_version,
    } = cli.command
    {
        let info = EquipmentInfo {
            eqpid: config.eqpid.clone(),
            name,
            model,
            serial,
            application,
            version: sw_version,
            db_version,
            date: Local::now().naive_local(),
            serv_ts: None,
        };
        let outcome = ingestor.submit_equipment_info(info).await?;
        if cli.json {
            print_json(&outcome)?;
        } else {
            info!(?outcome, "Equipment info processed");
        }
    }

    Ok(ExitCode::SUCCESS)
}
