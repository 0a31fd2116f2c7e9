//! Logging setup
//!
//! Coordinator and workers share the same configuration; every line carries
//! the target so worker output interleaved on stderr stays readable.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter: library code at info, this crate at debug.
pub const DEFAULT_FILTER: &str = "info,prefork=debug";

/// Install the global subscriber: stderr, plus `log_file` when given.
///
/// `log_level` takes a level or a full `EnvFilter` directive; `None` falls
/// back to `RUST_LOG`, then to [`DEFAULT_FILTER`].
///
/// ```no_run
/// prefork::logging::init_logger(Some("debug"), None).unwrap();
/// ```
pub fn init_logger(log_level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_writer(Arc::new(open_log_file(path)?))
                .with_target(true)
                .with_ansi(false),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(log_level)?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!("Logger initialized pid={}", std::process::id());
    Ok(())
}

/// Coordinator and workers all append to the same file.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn build_filter(log_level: Option<&str>) -> Result<EnvFilter> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    Ok(filter)
}
