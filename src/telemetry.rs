//! Process-wide tracing setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LoggingSection};

/// Keeps the non-blocking file writer alive. Drop it at shutdown to flush.
#[must_use]
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` wins, then the configured directive.
/// `verbose` bumps the crate to debug.
pub fn build_filter(settings: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .with_context(|| format!("Invalid log filter '{}'", settings.filter))?;
    if verbose {
        let directive = "promptreel=debug"
            .parse()
            .context("Invalid verbose directive")?;
        Ok(filter.add_directive(directive))
    } else {
        Ok(filter)
    }
}

pub fn init(settings: &LoggingSection, verbose: bool) -> Result<TelemetryGuard> {
    let filter = build_filter(settings, verbose)?;

    let (file_layer, guard) = match &settings.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "promptreel.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = match settings.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.context("Failed to install tracing subscriber")?;

    Ok(TelemetryGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_configured_directive() {
        let settings = LoggingSection {
            filter: "warn,promptreel=info".to_string(),
            ..LoggingSection::default()
        };
        assert!(build_filter(&settings, true).is_ok());
    }
}
