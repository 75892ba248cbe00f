//! Logging initialization using tracing.

use anyhow::{Context, Result};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter for `level`. `RUST_LOG` wins when it is set and valid.
///
/// # Arguments
/// * `level` - Log level or directive string (trace, debug, info, `labvisor_hypervisor=debug`, ...)
pub fn parse_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))
}

/// Initialize the tracing subscriber with the specified log level.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = parse_filter(level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = parse_filter(level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Logs how long an operation took when finished.
pub struct TimedOperation {
    name: String,
    started: Instant,
}

impl TimedOperation {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Log completion and return the elapsed milliseconds.
    pub fn finish(self) -> u128 {
        let elapsed = self.elapsed_ms();
        info!(operation = %self.name, elapsed_ms = elapsed as u64, "Operation completed");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_levels_and_directives() {
        std::env::remove_var("RUST_LOG");
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("warn,labvisor_hypervisor=debug").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        std::env::remove_var("RUST_LOG");
        assert!(parse_filter("labvisor=loud").is_err());
    }

    #[test]
    fn timed_operation_measures() {
        let op = TimedOperation::start("noop");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(op.finish() >= 5);
    }
}
