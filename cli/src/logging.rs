// Log setup: stderr plus an optional daily rolling file

use crate::config::{Config, LogFormat};
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Keep the guard alive so file logs flush.
pub fn init(verbose: u8, config: &Config) -> Result<Option<WorkerGuard>> {
    let directive = match verbose {
        0 => config.log.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if verbose == 0 => filter,
        _ => EnvFilter::try_new(directive)
            .with_context(|| format!("Invalid log filter: {}", directive))?,
    };
    let json = config.log.format == LogFormat::Json;

    let console_text = (!json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let console_json = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let mut guard = None;
    let (file_text, file_json) = if config.log.file {
        let dir = config.log_dir()?;
        std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(&dir, "jacquard.log");
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        if json {
            (None, Some(fmt::layer().json().with_writer(writer)))
        } else {
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), None)
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_text)
        .with(file_json)
        .init();

    tracing::debug!(
        "Logging initialized, format {}, file output {}",
        config.log.format,
        config.log.file
    );
    Ok(guard)
}
