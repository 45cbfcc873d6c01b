//! Background daemon
//!
//! Owns the model slot, the download manager, the key store and the HTTP
//! gateway, and serves line-delimited JSON commands over a unix socket.

pub mod client;
pub mod dispatcher;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod server;

pub use client::{ClientError, DaemonClient};
pub use dispatcher::DaemonContext;
pub use paths::DaemonPaths;
pub use protocol::{Command, Response};

use crate::storage::huggingface::HubError;
use crate::storage::keys::KeyStoreError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fatal daemon errors; `main` exits non-zero on any of these
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Daemon already running (PID {0})")]
    AlreadyRunning(u32),

    #[error("Cannot bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Keys(#[from] KeyStoreError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

/// Daemon lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    NotRunning,
    Starting,
    Serving,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonPhase::NotRunning => "not_running",
            DaemonPhase::Starting => "starting",
            DaemonPhase::Serving => "serving",
            DaemonPhase::Stopping => "stopping",
            DaemonPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
