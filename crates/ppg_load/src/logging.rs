//! Process-wide tracing setup: stdout plus a dated, appended log file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "ppg_load=info,warn";

/// `<log_dir>/import_log_YYYYMMDD.log` for today's local date.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("import_log_{}.log", Local::now().format("%Y%m%d")))
}

/// Installs the global subscriber and returns the log file in use.
pub fn init(log_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let path = log_file_path(log_dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(
            // Keep a practical default if `RUST_LOG` is absent or invalid.
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("install tracing subscriber")?;
    Ok(path)
}
