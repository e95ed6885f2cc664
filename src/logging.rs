//! Tracing configuration and log routing.
//!
//! The application logs to stdout using a compact or JSON formatter selected by
//! `LOG_FORMAT`, and optionally to a file. When `RAGPIPE_LOG_FILE` is set, logs are
//! appended to that path; otherwise a file logger is created under `logs/ragpipe.log`.
//! A non-blocking writer is used to minimize contention on hot paths.
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing subscribers for stdout and optional file logging.
///
/// - Respects `LOG_LEVEL` (falling back to `RUST_LOG`, then `info`) for filtering.
/// - `LOG_FORMAT=json` switches the stdout layer to structured JSON; anything else
///   uses the compact formatter.
/// - Installs a non-blocking file layer when a log file can be opened, and keeps the
///   writer guard alive for the process lifetime.
pub fn init_tracing() {
    let env_filter = std::env::var("LOG_LEVEL")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let json_stdout = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let file_writer = configure_file_writer();

    if json_stdout {
        let stdout_layer = fmt::layer().json().with_target(true);
        if let Some(writer) = file_writer {
            let file_layer = file_layer(writer);
            registry.with(stdout_layer).with(file_layer).init();
        } else {
            registry.with(stdout_layer).init();
        }
    } else {
        let stdout_layer = fmt::layer().with_target(false).compact();
        if let Some(writer) = file_writer {
            let file_layer = file_layer(writer);
            registry.with(stdout_layer).with(file_layer).init();
        } else {
            registry.with(stdout_layer).init();
        }
    }
}

fn file_layer<S>(writer: NonBlocking) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
}

/// Build a non-blocking writer over the resolved log destination.
///
/// Returns `None` (stdout-only logging) when no destination can be opened.
fn configure_file_writer() -> Option<NonBlocking> {
    match open_log_sink() {
        Ok(sink) => {
            let (writer, guard) = tracing_appender::non_blocking(sink);
            let _ = LOG_GUARD.set(guard);
            Some(writer)
        }
        Err(detail) => {
            // Tracing is not installed yet, so this can only go to stderr.
            eprintln!("File logging disabled: {detail}");
            None
        }
    }
}

/// Resolve the file log destination: an explicit `RAGPIPE_LOG_FILE` path when set,
/// otherwise an append-only `logs/ragpipe.log`.
fn open_log_sink() -> Result<Box<dyn std::io::Write + Send>, String> {
    let path = match std::env::var("RAGPIPE_LOG_FILE") {
        Ok(explicit) => std::path::PathBuf::from(explicit),
        Err(_) => {
            std::fs::create_dir_all("logs")
                .map_err(|err| format!("cannot create logs directory: {err}"))?;
            std::path::PathBuf::from("logs/ragpipe.log")
        }
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("cannot open {}: {err}", path.display()))?;
    Ok(Box::new(file))
}
