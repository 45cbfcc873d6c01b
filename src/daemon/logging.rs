//! Daemon logging
//!
//! Records go to `daemon.log`, and to stderr as well when running in the
//! foreground. The level filter sits in a reload layer so `set_log_level`
//! takes effect without a restart.

use super::DaemonError;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Map a configured level name to a filter directive
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_uppercase().as_str() {
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" => Some("error"),
        _ => None,
    }
}

fn filter_for(directive: &str) -> EnvFilter {
    EnvFilter::new(format!("{},hyper=warn,reqwest=warn,h2=warn", directive))
}

/// Runtime control over the installed filter
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) -> Result<(), String> {
        let directive =
            level_directive(level).ok_or_else(|| format!("Invalid log level: {}", level))?;
        self.filter
            .reload(filter_for(directive))
            .map_err(|e| e.to_string())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(log_file: &Path, level: &str, foreground: bool) -> Result<LogHandle, DaemonError> {
    let initial = match std::env::var("RUST_LOG") {
        Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ => filter_for(level_directive(level).unwrap_or("info")),
    };
    let (filter, handle) = reload::Layer::new(initial);

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    let file_layer = fmt::layer().with_writer(Mutex::new(file)).with_ansi(false);
    let stderr_layer = foreground.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| DaemonError::Logging(e.to_string()))?;

    Ok(LogHandle { filter: handle })
}
