//! Download session state
//!
//! The state struct sits behind its own lightweight lock so status polling
//! never waits on the model lock or the transfer itself.

use crate::storage::format_size;
use crate::storage::huggingface::RepoFile;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Idle,
    Preparing,
    Downloading,
    Completed,
    Cancelled,
    Error,
}

impl DownloadPhase {
    /// Preparing or downloading
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadPhase::Preparing | DownloadPhase::Downloading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Downloading,
    Done,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileProgress {
    pub name: String,
    pub size: u64,
    pub size_str: String,
    pub status: FileStatus,
}

impl From<&RepoFile> for FileProgress {
    fn from(file: &RepoFile) -> Self {
        Self {
            name: file.name.clone(),
            size: file.size,
            size_str: format_size(file.size),
            status: FileStatus::Pending,
        }
    }
}

/// Shared state of the current (or last) session
#[derive(Debug, Clone)]
pub struct DownloadState {
    /// Monotonic session number; writes tagged with an older number are dropped
    pub session: u64,
    pub model_id: Option<String>,
    pub phase: DownloadPhase,
    pub files: Vec<FileProgress>,
    pub current_idx: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second
    pub speed: f64,
    pub error: Option<String>,
}

impl Default for DownloadState {
    fn default() -> Self {
        Self {
            session: 0,
            model_id: None,
            phase: DownloadPhase::Idle,
            files: Vec::new(),
            current_idx: 0,
            bytes_done: 0,
            bytes_total: 0,
            speed: 0.0,
            error: None,
        }
    }
}

/// Wire form of [`DownloadState`] returned by `download_status`
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub active: bool,
    pub model_id: Option<String>,
    pub phase: DownloadPhase,
    pub files: Vec<FileProgress>,
    pub current_idx: usize,
    pub total_files: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub progress_pct: f64,
    pub speed: f64,
    pub speed_str: String,
    pub error: Option<String>,
}

impl DownloadState {
    pub fn snapshot(&self) -> DownloadSnapshot {
        let progress_pct = if self.bytes_total > 0 {
            ((self.bytes_done as f64 / self.bytes_total as f64) * 1000.0).round() / 10.0
        } else if self.phase == DownloadPhase::Completed {
            100.0
        } else {
            0.0
        };

        DownloadSnapshot {
            active: self.phase.is_active(),
            model_id: self.model_id.clone(),
            phase: self.phase,
            files: self.files.clone(),
            current_idx: self.current_idx,
            total_files: self.files.len(),
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            progress_pct,
            speed: self.speed,
            speed_str: format!("{}/s", format_size(self.speed as u64)),
            error: self.error.clone(),
        }
    }

    /// Flip every file still pending or in flight to stopped
    pub fn stop_unfinished(&mut self) {
        for file in &mut self.files {
            if matches!(file.status, FileStatus::Pending | FileStatus::Downloading) {
                file.status = FileStatus::Stopped;
            }
        }
    }
}

/// A worker's view of the shared state, bound to one session number
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    state: Arc<Mutex<DownloadState>>,
}

impl SessionHandle {
    pub fn new(id: u64, state: Arc<Mutex<DownloadState>>) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Apply `f` if this session is still the current one.
    ///
    /// Returns false when a newer session has taken over the state.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut DownloadState),
    {
        let mut state = self.state.lock();
        if state.session != self.id {
            return false;
        }
        f(&mut state);
        true
    }
}
