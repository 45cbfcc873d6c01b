//! Model downloads
//!
//! Cancellable, resumable transfers from the hub into the local cache, one
//! session at a time.

pub mod cancel;
pub mod manager;
pub mod session;
pub mod transfer;

use crate::storage::huggingface::HubError;
use thiserror::Error;

pub use manager::DownloadManager;
pub use session::{DownloadPhase, DownloadSnapshot, FileStatus};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Hub(#[from] HubError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model id: {0}")]
    InvalidModelId(String),

    #[error("None of the requested files exist in {0}")]
    NoMatchingFiles(String),

    #[error("Download of {name} incomplete: got {got} bytes, expected {expected}")]
    Incomplete { name: String, got: u64, expected: u64 },

    #[error("Download worker could not be started: {0}")]
    Spawn(String),
}
