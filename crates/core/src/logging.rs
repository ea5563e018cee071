//! Logging plumbing: filter selection and rolling file sink construction.
//! The subscriber itself is assembled by the binary crate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Runtime crates that log aggressively at info level.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "synclip";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
}

/// Pick the tracing filter string: explicit `--log-filter` beats `-v`
/// counts, which beat `RUST_LOG`, which beats the default. The noise filter is appended only when the user did not
/// write a filter themselves.
pub fn select_log_filter(options: &LoggingOptions) -> String {
    if let Some(filter) = options
        .cli_log_filter
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        return filter.to_string();
    }

    let implicit = match options.verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };

    if let Some(level) = implicit {
        return format!("{level},{DEFAULT_NOISE_FILTER}");
    }

    if let Some(env_filter) = options
        .rust_log_env
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        return env_filter.to_string();
    }

    format!("{DEFAULT_LOG_FILTER},{DEFAULT_NOISE_FILTER}")
}

/// Daily-rotating log file sink under `<data_dir>/logs`.
pub fn build_file_appender(data_dir: &Path) -> Result<(RollingFileAppender, PathBuf)> {
    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .build(&log_dir)
        .context("failed to create rolling log file appender")?;

    Ok((appender, log_dir))
}
