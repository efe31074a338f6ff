//! Logging initialization
//!
//! Structured logging via tracing, configured from the loaded config.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when set. With a `log_dir`
/// configured, output additionally goes to a daily-rotated file; the guard
/// must be held for the lifetime of the process.
pub fn init(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if let Some(dir) = &config.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "transdock-api.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(writer)
            .with_ansi(false)
            .try_init();
        Some(guard)
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
        None
    }
}
