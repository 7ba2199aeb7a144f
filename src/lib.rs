pub mod alerts;
pub mod coalescer;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod health;
pub mod models;
pub mod registry;
pub mod runner;
pub mod watch;
pub mod watcher;

pub use crate::config::{ConfigSource, ConfigStore};
pub use crate::engine::Engine;
pub use crate::errors::{AppError, AppResult};
pub use crate::registry::RegistrySnapshot;
pub use crate::runner::Collaborators;

use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// JSON logs under `<config_dir>/logs`, rotated daily. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(config_dir: &Path) -> AppResult<()> {
    let log_dir = config_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "monitor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
