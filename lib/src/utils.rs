//! Logging setup shared by every CLI entry point.

use tracing_subscriber::prelude::*;

use crate::config::Config;

/// Install a `tracing` subscriber: a stderr layer honoring `HAMMER_LOG` (or
/// `RUST_LOG`), plus a best-effort non-blocking append-only file layer at
/// `config.log_path`. The returned guard must be held for the lifetime of
/// the process; dropping it flushes and stops the file writer's background
/// thread. Returns `None` if the log file couldn't be opened — a read-only
/// or missing log directory is never fatal.
pub(crate) fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = std::env::var("HAMMER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if let Some(parent) = config.log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            tracing::debug!(path = %config.log_path, error = %e, "not logging to a file");
            None
        }
    }
}
