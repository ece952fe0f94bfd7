//! Logging setup and per-unit scoped loggers.
//!
//! Log records flow through `tracing`; [`init_logging`] installs a pretty
//! stdout layer plus a non-blocking daily-rolling file layer under
//! `<data_dir>/logs/`. The non-blocking writer owns a background worker
//! thread that drains queued records; the returned [`LogGuard`] must be
//! kept alive for the lifetime of the process or tail records are lost.

use std::path::Path;
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{CoreError, Result};

/// Keeps the log-drain worker alive; dropping it flushes and stops it.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Install the global tracing subscriber. Call once from the embedder,
/// before the runtime starts. Fails if a subscriber is already installed.
pub fn init_logging(data_dir: &Path, level: &str) -> Result<LogGuard> {
    let logs_dir = data_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("vanadium")
        .filename_suffix("log")
        .build(&logs_dir)
        .map_err(|e| CoreError::Internal(format!("failed to create log appender: {e}")))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().pretty())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|e| CoreError::Internal(format!("failed to install subscriber: {e}")))?;

    Ok(LogGuard { _worker: guard })
}

/// Logger scoped to a single unit. Every record carries the unit id, so
/// per-unit output can be filtered from the shared log stream.
#[derive(Debug, Clone)]
pub struct UnitLogger {
    unit_id: Arc<str>,
}

impl UnitLogger {
    pub fn new(unit_id: &str) -> Self {
        Self {
            unit_id: Arc::from(unit_id),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(unit = %self.unit_id, "{message}");
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(unit = %self.unit_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(unit = %self.unit_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(unit = %self.unit_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(unit = %self.unit_id, "{message}");
    }
}
