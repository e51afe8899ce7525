//! Logging setup
//!
//! Log output is configured through [`LogConfig`] (console, daily-rolled
//! file, or both; text or JSON lines) and can be turned into a subscriber
//! in two ways:
//!
//! - [`init_logging`] installs it process-wide and returns a [`LogGuard`]
//!   to hold until shutdown.
//! - [`LogScope::open`] builds a dispatcher that is not installed anywhere.
//!   The ingestor runs each file under its own scope: the file writer is
//!   opened when the invocation starts and flushed when the scope drops.
//!
//! Library code logs through `tracing` macros with key/value fields, e.g.
//! `info!(path = %path.display(), rows, "Uploaded batch")`.
//!
//! # Example
//!
//! ```no_run
//! use eqlog_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Watcher started");
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{level_filters::LevelFilter, Dispatch};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Minimum level a subscriber lets through
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => bail!("Invalid log level: {other}"),
        })
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    pub fn writes_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    pub fn writes_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => LogOutput::Console,
            "file" => LogOutput::File,
            "both" | "all" => LogOutput::Both,
            other => bail!("Invalid log output: {other}"),
        })
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => bail!("Invalid log format: {other}"),
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for rolled log files; unused for console-only output
    pub log_dir: PathBuf,

    /// File name prefix, suffixed with the date by the roller
    pub log_file_prefix: String,

    /// Extra `EnvFilter` directives, e.g. `"sqlx=warn,eqlog_ingest=debug"`
    pub filter_directives: Option<String>,

    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "eqlog".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_bool(name: &str, current: bool) -> bool {
    env_var(name)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(current)
}

impl LogConfig {
    /// Defaults overlaid with the environment; see [`LogConfig::merge_env`].
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay environment variables on `self`. Unset variables keep the
    /// current value.
    ///
    /// `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`,
    /// `LOG_FILTER`, `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`,
    /// `LOG_INCLUDE_TARGETS`.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(output) = env_var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = env_var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env_var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }

        self.include_location = env_bool("LOG_INCLUDE_LOCATION", self.include_location);
        self.include_thread_ids = env_bool("LOG_INCLUDE_THREAD_IDS", self.include_thread_ids);
        self.include_targets = env_bool("LOG_INCLUDE_TARGETS", self.include_targets);

        Ok(self)
    }

    /// Copy with the threshold lowered to at least `Debug`.
    pub fn with_debug(&self) -> Self {
        Self {
            level: self.level.min(LogLevel::Debug),
            ..self.clone()
        }
    }

    /// Copy that writes to the console only.
    pub fn console_only(&self) -> Self {
        Self {
            output: LogOutput::Console,
            ..self.clone()
        }
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }
}

/// Fluent construction of a [`LogConfig`]
#[derive(Debug, Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the global subscriber's file writer alive; flushes on drop.
#[must_use = "dropping the guard stops the background log writer"]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// A logging dispatcher bound to one unit of work.
///
/// Nothing is installed globally. Run code under [`LogScope::dispatch`]
/// (`tracing::dispatcher::with_default`, or `WithSubscriber` for futures)
/// and drop the scope when the work is done to flush buffered file output.
pub struct LogScope {
    dispatch: Dispatch,
    worker: Option<WorkerGuard>,
}

impl LogScope {
    pub fn open(config: &LogConfig) -> Result<Self> {
        let (dispatch, worker) = build_dispatch(config)?;
        Ok(Self { dispatch, worker })
    }

    /// Scope that forwards to whatever dispatcher is current right now.
    pub fn inherit() -> Self {
        Self {
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            worker: None,
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn writes_file(&self) -> bool {
        self.worker.is_some()
    }
}

impl std::fmt::Debug for LogScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogScope")
            .field("writes_file", &self.writes_file())
            .finish()
    }
}

/// Install `config` as the process-wide subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let (dispatch, worker) = build_dispatch(config)?;
    tracing::dispatcher::set_global_default(dispatch)
        .context("A global tracing subscriber is already installed")?;
    Ok(LogGuard { _worker: worker })
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let base = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .from_env_lossy();

    config
        .filter_directives
        .iter()
        .flat_map(|directives| directives.split(','))
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .try_fold(base, |filter, directive| {
            let directive = directive
                .parse::<Directive>()
                .with_context(|| format!("Invalid log filter directive: {directive}"))?;
            Ok(filter.add_directive(directive))
        })
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn build_dispatch(config: &LogConfig) -> Result<(Dispatch, Option<WorkerGuard>)> {
    let filter = build_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut worker = None;

    if config.output.writes_console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;

        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        worker = Some(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    Ok((Dispatch::new(subscriber), worker))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" both ".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_with_debug_only_lowers_threshold() {
        let info = LogConfig::builder().level(LogLevel::Warn).build();
        assert_eq!(info.with_debug().level, LogLevel::Debug);

        let trace = LogConfig::builder().level(LogLevel::Trace).build();
        assert_eq!(trace.with_debug().level, LogLevel::Trace);
    }

    #[test]
    fn test_console_only_keeps_other_settings() {
        let config = LogConfig::builder()
            .output(LogOutput::Both)
            .format(LogFormat::Json)
            .build()
            .console_only();
        assert_eq!(config.output, LogOutput::Console);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_scope_writes_file_and_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::builder()
            .output(LogOutput::File)
            .log_dir(dir.path())
            .log_file_prefix("scope-test")
            .build();

        let scope = LogScope::open(&config).unwrap();
        assert!(scope.writes_file());
        tracing::dispatcher::with_default(scope.dispatch(), || {
            tracing::info!(rows = 3, "scoped message");
        });
        drop(scope);

        let contents: String = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(contents.contains("scoped message"));
    }

    #[test]
    fn test_invalid_filter_directive_is_rejected() {
        let config = LogConfig::builder()
            .filter_directives("sqlx=warn,eqlog=notalevel")
            .build();
        assert!(LogScope::open(&config).is_err());
    }
}
