use std::path::Path;

use chrono::Local;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::error::{Error, Result};

/// Filter variable, e.g. `TETHER_LOG=tether::aggregation=debug`.
pub const LOG_ENV: &str = "TETHER_LOG";
/// Directory for log files when no directory is passed explicitly.
pub const LOG_DIR_ENV: &str = "TETHER_LOG_DIR";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("off"))
}

/// Installs the global subscriber. Logging is off unless `TETHER_LOG` is set.
///
/// With a log directory (argument or `TETHER_LOG_DIR`) output goes to a
/// timestamp-named file in it; otherwise to stderr.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<()> {
    let env_dir = std::env::var_os(LOG_DIR_ENV).map(std::path::PathBuf::from);
    let log_dir = log_dir.map(Path::to_path_buf).or(env_dir);

    if let Some(log_dir) = log_dir {
        std::fs::create_dir_all(&log_dir)?;
        let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        let file_appender = rolling::never(&log_dir, &file_name);

        tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(env_filter())
            .try_init()
            .map_err(|e| Error::Tracing(e.to_string()))?;

        tracing::debug!(
            target: "tether::utils::tracing",
            path = %log_dir.join(&file_name).display(),
            "Tracing initialized with file output"
        );
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(true),
            )
            .with(env_filter())
            .try_init()
            .map_err(|e| Error::Tracing(e.to_string()))?;

        tracing::debug!(
            target: "tether::utils::tracing",
            "Tracing initialized with stderr output"
        );
    }

    Ok(())
}
