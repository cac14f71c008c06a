//! Tracing setup for the CLI and the server.
//!
//! The filter comes from `PCC_LOG`, then `RUST_LOG`, then the configured
//! default. Output goes to stderr; a daily rolling file is added when
//! `[logging] file_dir` is set.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, PccConfig};

fn build_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env("PCC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(config: &PccConfig) -> Result<Option<WorkerGuard>> {
    let filter = if config.verbose {
        EnvFilter::new(config.log_filter())
    } else {
        build_filter(&config.log_filter())
    };
    let format = config.toml.logging.format;

    let (file_writer, guard) = match &config.toml.logging.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "pcc.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => {
            let file_layer = file_writer.map(|w| fmt::layer().json().with_writer(w));
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
        LogFormat::Text => {
            let file_layer = file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w));
            registry
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .with(file_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
    }
    Ok(guard)
}
