//! Process-wide tracing setup.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::errors::{ExecError, ExecResult};
use crate::options::LoggingOptions;

/// Keeps the file appender's flush thread alive for the process lifetime.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

const DEFAULT_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "execmode.log";

/// Install the global subscriber.
///
/// Thread names are always printed: they are how a reader tells an
/// event-loop continuation from a worker-pool one. Calling this twice is a
/// no-op.
pub fn init_logging(options: &LoggingOptions) -> ExecResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                ExecError::Config(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .with(file_layer)
        .try_init();

    if let Err(e) = installed {
        // Another subscriber (e.g. a test harness) got there first.
        tracing::debug!(error = %e, "global subscriber already installed");
    }

    let _ = LOG_GUARD.set(guard);
    Ok(())
}
