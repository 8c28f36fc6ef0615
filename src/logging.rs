use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::{AppError, AppResult};

pub const ENV_LOG_FILTER: &str = "PAGEFILE_LOG";
pub const DEFAULT_FILTER: &str = "pagefile=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "pagefile.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for the rotating JSON log file. Stdout only when unset.
    pub dir: Option<PathBuf>,
    /// Filter used when `PAGEFILE_LOG` is not set.
    pub default_filter: Option<String>,
}

fn env_filter(options: &LogOptions) -> EnvFilter {
    let fallback = options
        .default_filter
        .clone()
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    let directives = std::env::var(ENV_LOG_FILTER).unwrap_or(fallback);
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: JSON lines on stdout, plus a daily rotated
/// JSON file when `options.dir` is set.
///
/// The returned guard must be held until the process exits or buffered file
/// lines are lost. Calling `init` twice is harmless; the second call keeps
/// the first subscriber.
pub fn init(options: &LogOptions) -> AppResult<Option<WorkerGuard>> {
    let _ = tracing_log::LogTracer::init();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stdout);

    let (file_layer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "log_dir_create")
                    .with_context("path", dir.display().to_string())
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter(options))
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_creates_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        let guard = init(&LogOptions {
            dir: Some(logs.clone()),
            default_filter: None,
        })
        .expect("init logging");
        assert!(guard.is_some());
        assert!(logs.is_dir());
    }
}
