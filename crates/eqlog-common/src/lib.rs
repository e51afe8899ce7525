//! EQLog Common Library
//!
//! Shared error handling and logging for the EQLog workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`EqlogError`] taxonomy and [`Result`] alias
//! - **Logging**: [`logging::LogConfig`], process-wide initialization and
//!   per-invocation [`logging::LogScope`]s
//!
//! # Example
//!
//! ```no_run
//! use eqlog_common::logging::{LogConfig, LogScope};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! let scope = LogScope::open(&config)?;
//! tracing::dispatcher::with_default(scope.dispatch(), || {
//!     tracing::info!("inside the scope");
//! });
//! drop(scope); // flushes the file writer
//! # Ok::<(), anyhow::Error>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EqlogError, Result};
