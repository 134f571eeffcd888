use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use pulse_core::settings::Settings;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ── Directory bootstrap ────────────────────────────────────────────────────────

/// Ensure the data directory, the artifact directory and the database's
/// parent directory exist.
pub fn ensure_directories(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(settings.data_dir())?;
    std::fs::create_dir_all(settings.artifact_dir())?;
    if let Some(parent) = settings.database_path().parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ── Logging bootstrap ──────────────────────────────────────────────────────────

/// Map a `DEBUG|INFO|WARNING|ERROR|CRITICAL` level name onto an
/// [`EnvFilter`] directive. Anything else is passed through as a directive.
pub fn filter_directive(log_level: &str) -> String {
    match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug".to_string(),
        "INFO" => "info".to_string(),
        "WARNING" => "warn".to_string(),
        "ERROR" | "CRITICAL" => "error".to_string(),
        _ => log_level.to_string(),
    }
}

/// Initialise the global `tracing` subscriber.
///
/// Output goes to stderr, or is appended to `log_file` when one is given.
/// An unrecognised level falls back to `info`.
pub fn setup_logging(log_level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter_directive(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (stderr_layer, file_layer) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => (Some(fmt::layer().with_target(false)), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
