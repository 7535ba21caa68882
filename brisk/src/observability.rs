//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::{
    config::{LogFormat, LoggingConfig},
    error::Result,
};

/// Install the global tracing subscriber
///
/// An unparsable filter directive falls back to `info`. Calling this when a
/// subscriber is already installed leaves the existing one in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.report_caller)
        .with_line_number(config.report_caller);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
        return Ok(());
    }

    tracing::info!(level = %config.level, format = ?config.format, "Tracing initialized");

    Ok(())
}

/// Flush and shut down tracing
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}
