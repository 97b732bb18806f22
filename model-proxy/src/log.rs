use std::io;
use std::time::Instant;

use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking stdout writer alive; dropping it flushes
/// whatever is still buffered.
pub struct LoggerGuard {
    _stdio_guard: WorkerGuard,
}

/// Initializes the process-wide subscriber.
///
/// The platform scrapes container stdout, so everything goes there. The
/// level defaults to `info` and honors the `LOG_LEVEL` environment
/// variable (any `tracing` filtering directive is accepted).
pub fn init() -> anyhow::Result<LoggerGuard> {
    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio).with_ansi(false);

    let env_filter = match std::env::var("LOG_LEVEL") {
        Ok(directives) => EnvFilter::try_new(directives).context("invalid LOG_LEVEL directives")?,
        Err(_) => EnvFilter::new("info"),
    };

    tracing_subscriber::registry()
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _stdio_guard: stdio_guard,
    })
}

/// One record per completed request, emitted whatever the outcome.
pub(crate) fn access_log(method: &axum::http::Method, path: &str, status: u16, started: Instant) {
    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    info!(target: "access", %method, path, status, duration_us, "request completed");
}
