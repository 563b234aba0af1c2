//! Launcher binary entry point
//!
//! `paracelrun <launch.json> [entry command...]`
//!
//! Loads the launch file, runs one launch and exits with its result code.
//! Log lines go to stderr and are appended to `paracelrun_log` in the working
//! directory; `PARACELRUN_LOG` names another file, or disables it when empty.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use launch_core::{Error, LaunchConfig, LaunchReport, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use launcher::LaunchOrchestrator;

const DEFAULT_LOG_FILE: &str = "paracelrun_log";

/// Log file to append to, `None` when file logging is switched off
fn log_file_path(var: Option<OsString>) -> Option<PathBuf> {
    match var {
        Some(path) if path.is_empty() => None,
        Some(path) => Some(PathBuf::from(path)),
        None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
    }
}

#[tokio::main]
async fn main() {
    let log_path = log_file_path(std::env::var_os("PARACELRUN_LOG"));
    let log_file = log_path
        .as_ref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path));

    let (file_layer, file_error) = match log_file {
        Some(Ok(file)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paracelrun=info,launcher=info,launch_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let (Some(path), Some(e)) = (&log_path, file_error) {
        tracing::warn!(path = %path.display(), error = %e, "Cannot open log file");
    }

    let code = match run(std::env::args().skip(1).collect()).await {
        Ok(report) => {
            tracing::info!(
                launch_id = %report.launch_id,
                result = %report.result,
                final_state = %report.final_state,
                "Launch finished"
            );
            report.result.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "Could not start launch");
            1
        }
    };

    std::process::exit(code);
}

async fn run(args: Vec<String>) -> Result<LaunchReport> {
    let (path, entry) = args.split_first().ok_or_else(|| Error::InvalidConfig {
        message: "usage: paracelrun <launch.json> [entry command...]".to_string(),
    })?;

    let mut config = LaunchConfig::from_json_file(path)?;
    if !entry.is_empty() {
        config.entry_command = entry.to_vec();
    }

    tracing::info!(
        config = %path,
        servers = config.server_count,
        workers = config.worker_count,
        method = %config.server.method,
        "Starting launch"
    );

    Ok(LaunchOrchestrator::new(config).launch().await)
}
