use std::fs::OpenOptions;
use std::sync::Arc;

use camino::Utf8Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::LogFormat;

/// Stderr logging plus, when a path is given, an append-only log file in the
/// application data root. `RUST_LOG` (or the `LOG_LEVEL` alias) overrides the
/// default `info` filter.
pub fn init(format: LogFormat, log_file: Option<&Utf8Path>) {
    if std::env::var("RUST_LOG").is_err() {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            std::env::set_var("RUST_LOG", level);
        }
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file_handle = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .ok()
    });

    match format {
        LogFormat::Json => {
            let file_layer = log_file_handle.map(|file| {
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(file_layer)
                .init();
        }
        LogFormat::Text => {
            let file_layer = log_file_handle
                .map(|file| fmt::layer().with_ansi(false).with_writer(Arc::new(file)));
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .init();
        }
    }
}
