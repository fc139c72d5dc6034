//! Logging setup for ruckd.
//!
//! `RUCK_DEBUG_LOG=1` forces debug output; otherwise `RUST_LOG` applies,
//! falling back to `info`. Console output goes to stderr so stdout stays
//! machine-readable. With a log directory, a daily-rolling file is written as
//! well through a non-blocking writer whose guard must outlive `main`.

use std::env;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "ruckd.log";

pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = env_filter();
    let console = fmt::layer().with_writer(io::stderr).with_target(false);

    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init();
        return None;
    };

    if let Err(err) = fs_err::create_dir_all(dir) {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr only");
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer().with_writer(writer).with_ansi(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
    Some(guard)
}

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var("RUCK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
