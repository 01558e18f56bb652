//! Tracing configuration and log routing.
//!
//! The server logs to stdout and to a file written through a non-blocking appender, since
//! watchdog reaps and job failures are emitted from background tasks. `REINDEX_LOG_FILE`
//! selects the file (default `logs/discovery-reindexer.log`) and `REINDEX_LOG_ROTATION`
//! (`never`, `hourly`, `daily`) its rotation. The operator CLI logs to stderr only, leaving
//! stdout to command output.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILE: &str = "logs/discovery-reindexer.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing for the server: compact stdout plus a file layer.
///
/// Respects `RUST_LOG` (defaults to `info`). Falls back to stdout only when the log file
/// cannot be prepared.
pub fn init_tracing() {
    let stdout_layer = fmt::layer().with_target(false).compact();
    let registry = tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(stdout_layer);

    match file_writer(&log_file_path(), rotation_from_env()) {
        Ok(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        Err(err) => {
            registry.init();
            tracing::warn!(error = %err, "File logging disabled");
        }
    }
}

/// Configure tracing for one-shot CLI commands: stderr only, `warn` unless `RUST_LOG` says
/// otherwise.
pub fn init_cli_tracing() {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(stderr_layer)
        .try_init();
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn log_file_path() -> PathBuf {
    std::env::var("REINDEX_LOG_FILE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

fn rotation_from_env() -> Rotation {
    parse_rotation(std::env::var("REINDEX_LOG_ROTATION").ok().as_deref())
}

fn parse_rotation(value: Option<&str>) -> Rotation {
    match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        Some("hourly") => Rotation::HOURLY,
        Some("daily") => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Split `path` into directory and file name, create the directory, and wrap a rolling
/// appender in a non-blocking writer whose guard lives for the process lifetime.
fn file_writer(path: &Path, rotation: Rotation) -> std::io::Result<NonBlocking> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("log path {} has no file name", path.display()),
        )
    })?;
    std::fs::create_dir_all(directory)?;

    let appender = RollingFileAppender::new(rotation, directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Ok(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_defaults_to_never() {
        assert_eq!(parse_rotation(None), Rotation::NEVER);
        assert_eq!(parse_rotation(Some("weekly")), Rotation::NEVER);
        assert_eq!(parse_rotation(Some(" Daily ")), Rotation::DAILY);
        assert_eq!(parse_rotation(Some("hourly")), Rotation::HOURLY);
    }

    #[test]
    fn path_without_file_name_is_rejected() {
        let error = file_writer(Path::new("/"), Rotation::NEVER).expect_err("no file name");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }
}
