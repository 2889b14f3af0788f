//! Logging setup for Strata binaries.

use anyhow::Result;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

/// Initialize structured JSON logging with hourly-rolling files and a
/// runtime-reloadable level filter. Returns the reload handle so the
/// filter can be updated without restarting.
pub fn init(dir: &str, level: Level) -> Result<reload::Handle<EnvFilter, Registry>> {
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, dir, "stratad.log");
    let (filter, handle) = reload::Layer::new(EnvFilter::default().add_directive(level.into()));
    let fmt_layer = fmt::layer()
        .with_writer(file_appender)
        .json()
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(handle)
}

/// Plain human-readable logging to stderr, for CLI tools and local runs.
/// Safe to call more than once.
pub fn init_stderr(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}
