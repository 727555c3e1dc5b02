use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Log file for `component` under `log_dir`, one per day.
pub fn log_file_path(log_dir: &Path, component: &str) -> PathBuf {
    log_dir.join(format!("{component}_{}.log", Local::now().format("%Y%m%d")))
}

/// Installs the global subscriber. Events go to stdout and are appended to the
/// component's daily log file. Nothing is written to stderr: the automation
/// stage treats extractor stderr output as a failure.
pub fn init(log_dir: &Path, component: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let path = log_file_path(log_dir, component);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_named_after_component_and_day() {
        let path = log_file_path(Path::new("logs"), "etl");
        let name = path.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.starts_with("etl_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "etl_20240101.log".len());
    }
}
