//! Logging setup for the airdrop worker
//!
//! Honors LOG_DESTINATION=console|file, LOG_DIR and LOG_FILE_PREFIX. With
//! file output, logs roll daily.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build the filter: `verbose` forces debug for `crate_names`, otherwise
/// RUST_LOG wins and falls back to info for `crate_names`.
fn build_filter(verbose: bool, crate_names: &[&str]) -> EnvFilter {
    let directives = |level: &str| {
        crate_names
            .iter()
            .map(|name| format!("{}={}", name.replace('-', "_"), level))
            .collect::<Vec<_>>()
            .join(",")
    };
    if verbose {
        EnvFilter::new(format!("{},info", directives("debug")))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{},warn", directives("info"))))
    }
}

/// Initialize the tracing subscriber.
///
/// - `verbose`: debug level for `crate_names`
/// - `crate_names`: crates whose logs are wanted at info (or debug)
/// - `default_log_prefix`: LOG_FILE_PREFIX fallback when LOG_DESTINATION=file
///
/// The returned guard flushes file output on drop; keep it alive for the
/// life of the process.
pub fn init_logging(verbose: bool, crate_names: &[&str], default_log_prefix: &str) -> Option<WorkerGuard> {
    let filter = build_filter(verbose, crate_names);

    let log_dest = std::env::var("LOG_DESTINATION").unwrap_or_else(|_| "console".to_string());
    if log_dest.eq_ignore_ascii_case("file") {
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        let log_prefix = std::env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| default_log_prefix.to_string());
        let file_appender = tracing_appender::rolling::daily(&log_dir, &log_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(filter)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
        None
    }
}
