//! Tracing subscriber initialisation.
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `info`). When a log
//! directory is given, the same events are also written to `hvplane.log`
//! in it, never rotated.
//!
//! The returned guard must be kept alive for the duration of the process
//! so that buffered file output is flushed on exit.

use std::path::Path;

use hvplane_shared::errors::{HvError, HvResult};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::runtime::constants::filenames;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// A second call, or a call after another subscriber was installed, leaves
/// the existing subscriber in place and returns an inert guard.
pub fn init_logging(log_dir: Option<&Path>) -> HvResult<LogGuard> {
    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
        return Ok(LogGuard { _file_guard: None });
    };

    std::fs::create_dir_all(dir).map_err(|e| {
        HvError::Config(format!("cannot create log directory {}: {}", dir.display(), e))
    })?;
    let file_appender = tracing_appender::rolling::never(dir, filenames::LOG);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(LogGuard {
        _file_guard: installed.then_some(guard),
    })
}
