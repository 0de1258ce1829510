//! Structured logging bootstrap, grounded on the original service's
//! `configure_logging`: level + format (json vs plain console) are
//! independently configurable, and the noisy transport crates get their
//! own quieter floor so they don't drown out application logs. Emits to
//! both stdout and a daily-rolling file so logs survive a terminal
//! that's gone by the time someone needs them.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::MonitoringConfig;

/// Installs the global tracing subscriber. Call once, at process start,
/// and keep the returned guard alive for the process lifetime — dropping
/// it stops the background thread that flushes the file appender.
pub fn init(cfg: &MonitoringConfig) -> WorkerGuard {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,tonic=warn,h2=warn", cfg.log_level)))
    };

    let file_appender = tracing_appender::rolling::daily(&cfg.log_dir, "vectordb.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer().with_target(true);
    let file_layer = fmt::layer().with_target(true).with_writer(non_blocking).with_ansi(false);

    let registry = tracing_subscriber::registry().with(filter());

    if cfg.log_format.eq_ignore_ascii_case("json") {
        registry.with(stdout_layer.json()).with(file_layer.json()).init();
    } else {
        registry.with(stdout_layer).with(file_layer).init();
    }

    guard
}
