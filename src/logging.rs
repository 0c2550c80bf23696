//! Tracing bootstrap for the gateway binary
//!
//! Stdout always receives events in the compact format. When the operator
//! passes `--log-dir`, the same stream is additionally appended to
//! `nntp-gateway.log` in that directory, without ANSI colors. Request
//! handlers attach the HTTP method and Message-ID as fields, so the file is
//! greppable per article.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE: &str = "nntp-gateway.log";

/// Keeps the non-blocking file writer alive; dropping it flushes whatever
/// is still buffered, so `main` holds it until the process exits.
pub struct LogGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the gateway's tracing subscriber and return the flush guard.
///
/// Log levels come from `RUST_LOG`, defaulting to `info`.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    // EnvFilter is not Clone; build one per layer
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(filter());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            LogGuard { _file: Some(guard) }
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            LogGuard { _file: None }
        }
    }
}
