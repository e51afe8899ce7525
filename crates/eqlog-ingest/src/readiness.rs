//! File readiness gate
//!
//! Equipment software keeps its log files open while writing them. Before a
//! file is parsed we take a shared advisory lock on it; if another process
//! holds it exclusively the attempt is retried according to a
//! [`RetryPolicy`]. Only lock contention is retried. Any other I/O error is
//! returned to the caller immediately.

use encoding_rs::Encoding;
use fs2::FileExt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use eqlog_common::{EqlogError, Result};

/// Interval between full-read attempts in [`read_all_text`].
pub const READ_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded retry: an attempt cap, an optional elapsed-time budget, and a
/// fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub budget: Option<Duration>,
}

impl RetryPolicy {
    /// Give up after `max_attempts` failed attempts.
    pub fn attempts(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            budget: None,
        }
    }

    /// Retry every `delay` until `budget` has elapsed.
    pub fn deadline(budget: Duration, delay: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            delay,
            budget: Some(budget),
        }
    }

    /// Decide after `failed_attempts` failures and `elapsed` time.
    pub fn decide(&self, failed_attempts: u32, elapsed: Duration) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if let Some(budget) = self.budget {
            if elapsed >= budget {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::RetryAfter(self.delay)
    }
}

/// Whether `err` means "someone else holds the file", as opposed to a real
/// I/O failure.
pub fn is_lock_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    let code = match err.raw_os_error() {
        Some(code) => code,
        None => return false,
    };

    if fs2::lock_contended_error().raw_os_error() == Some(code) {
        return true;
    }

    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        if code == 32 || code == 33 {
            return true;
        }
    }

    false
}

fn open_shared(path: &Path) -> io::Result<File> {
    let file = File::open(path)?;
    FileExt::try_lock_shared(&file)?;
    Ok(file)
}

/// Wait until `path` can be opened for shared reading.
///
/// Returns `Ok(false)` if the file is still locked after the policy gives
/// up; the caller should skip the file, not fail. Non-lock I/O errors
/// (missing file, permissions) are returned as `Err`.
pub async fn wait_until_ready(path: &Path, policy: &RetryPolicy) -> io::Result<bool> {
    let started = Instant::now();
    let mut failed_attempts = 0u32;

    loop {
        match open_shared(path) {
            Ok(file) => {
                FileExt::unlock(&file)?;
                if failed_attempts > 0 {
                    debug!(path = %path.display(), failed_attempts, "File became ready");
                }
                return Ok(true);
            },
            Err(e) if is_lock_contention(&e) => {
                failed_attempts += 1;
                match policy.decide(failed_attempts, started.elapsed()) {
                    RetryDecision::RetryAfter(delay) => {
                        debug!(path = %path.display(), failed_attempts, "File locked, waiting");
                        tokio::time::sleep(delay).await;
                    },
                    RetryDecision::GiveUp => {
                        warn!(
                            path = %path.display(),
                            failed_attempts,
                            "File still locked by another process, skipping"
                        );
                        return Ok(false);
                    },
                }
            },
            Err(e) => return Err(e),
        }
    }
}

fn read_bytes_shared(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = open_shared(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    FileExt::unlock(&file)?;
    Ok(bytes)
}

/// Decode legacy-codepage bytes. A byte-order mark overrides `encoding`.
pub fn decode_text(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!(encoding = used.name(), "Replaced malformed byte sequences while decoding");
    }
    text.into_owned()
}

/// Read the whole file as text, retrying every [`READ_RETRY_INTERVAL`]
/// while the failure is lock contention.
///
/// Fails with [`EqlogError::ReadTimeout`] once `timeout` has elapsed.
pub async fn read_all_text(
    path: &Path,
    encoding: &'static Encoding,
    timeout: Duration,
) -> Result<String> {
    let policy = RetryPolicy::deadline(timeout, READ_RETRY_INTERVAL);
    let started = Instant::now();
    let mut failed_attempts = 0u32;

    loop {
        match read_bytes_shared(path) {
            Ok(bytes) => return Ok(decode_text(&bytes, encoding)),
            Err(e) if is_lock_contention(&e) => {
                failed_attempts += 1;
                match policy.decide(failed_attempts, started.elapsed()) {
                    RetryDecision::RetryAfter(delay) => tokio::time::sleep(delay).await,
                    RetryDecision::GiveUp => {
                        return Err(EqlogError::ReadTimeout {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        })
                    },
                }
            },
            Err(e) => return Err(EqlogError::Io(e)),
        }
    }
}
