//! Download manager
//!
//! Each session runs on its own OS thread driving the daemon's runtime. A new
//! session cancels the previous one and its thread joins the previous thread
//! before touching the cache, so two sessions never write at the same time.

use crate::download::cancel::CancelFlag;
use crate::download::session::{
    DownloadPhase, DownloadSnapshot, DownloadState, FileProgress, FileStatus, SessionHandle,
};
use crate::download::transfer::{self, Throttle, TransferOutcome, PROGRESS_INTERVAL};
use crate::download::DownloadError;
use crate::storage::cache::ModelCache;
use crate::storage::huggingface::{safe_relative_path, Hub, HuggingFaceUrl};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Called with a fresh snapshot whenever the session publishes progress
pub type ProgressObserver = Arc<dyn Fn(&DownloadSnapshot) + Send + Sync>;

struct Worker {
    session: u64,
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// What a session was asked to fetch
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub repo_id: String,
    /// Explicit subset of the manifest; `None` means every file
    pub filenames: Option<Vec<String>>,
}

impl DownloadRequest {
    /// Accepts `owner/name`, `owner/name/file` or a hub URL
    pub fn parse(model_id: &str, filenames: Option<Vec<String>>) -> Result<Self, DownloadError> {
        let parsed = HuggingFaceUrl::parse(model_id).map_err(DownloadError::InvalidModelId)?;
        let filenames = match filenames.filter(|f| !f.is_empty()) {
            Some(list) => Some(list),
            None if !parsed.filename.is_empty() => Some(vec![parsed.filename]),
            None => None,
        };
        Ok(Self {
            repo_id: parsed.repo_id,
            filenames,
        })
    }
}

enum SessionEnd {
    Completed,
    Cancelled,
}

pub struct DownloadManager {
    hub: Arc<dyn Hub>,
    runtime: Handle,
    state: Arc<Mutex<DownloadState>>,
    worker: Mutex<Option<Worker>>,
    next_session: AtomicU64,
    observer: Option<ProgressObserver>,
}

impl DownloadManager {
    pub fn new(hub: Arc<dyn Hub>, runtime: Handle) -> Self {
        Self {
            hub,
            runtime,
            state: Arc::new(Mutex::new(DownloadState::default())),
            worker: Mutex::new(None),
            next_session: AtomicU64::new(1),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn hub(&self) -> &Arc<dyn Hub> {
        &self.hub
    }

    /// Start a session and return its number without waiting for any I/O.
    ///
    /// A running session is cancelled; the new worker waits for it to exit.
    pub fn start(&self, request: DownloadRequest, cache: ModelCache) -> Result<u64, DownloadError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.worker.lock();

        let previous = slot.take();
        if let Some(prev) = &previous {
            tracing::info!(
                previous = prev.session,
                next = id,
                "Cancelling previous download"
            );
            prev.cancel.cancel();
        }

        {
            let mut state = self.state.lock();
            *state = DownloadState {
                session: id,
                model_id: Some(request.repo_id.clone()),
                phase: DownloadPhase::Preparing,
                ..Default::default()
            };
        }

        let cancel = CancelFlag::new();
        let session = SessionHandle::new(id, self.state.clone());
        let job = SessionJob {
            hub: self.hub.clone(),
            cache,
            request,
            session,
            cancel: cancel.clone(),
            observer: self.observer.clone(),
            state: self.state.clone(),
        };
        let runtime = self.runtime.clone();

        let handle = std::thread::Builder::new()
            .name(format!("download-{}", id))
            .spawn(move || {
                if let Some(prev) = previous {
                    if prev.handle.join().is_err() {
                        tracing::error!(session = prev.session, "Previous download worker panicked");
                    }
                }
                runtime.block_on(job.run());
            })
            .map_err(|e| DownloadError::Spawn(e.to_string()))?;

        *slot = Some(Worker {
            session: id,
            cancel,
            handle,
        });
        Ok(id)
    }

    /// Ask the current session to stop. Returns false if nothing was running.
    pub fn cancel(&self) -> bool {
        let slot = self.worker.lock();
        match slot.as_ref() {
            Some(worker) if self.is_active() => {
                tracing::info!(session = worker.session, "Cancelling download");
                worker.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.state.lock().snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().phase.is_active()
    }

    /// Repo id of the in-flight session, if any
    pub fn active_model(&self) -> Option<String> {
        let state = self.state.lock();
        if state.phase.is_active() {
            state.model_id.clone()
        } else {
            None
        }
    }

    /// Cancel the current session and wait up to `wait` for its thread
    pub async fn shutdown(&self, wait: Duration) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        let join = tokio::task::spawn_blocking(move || worker.handle.join());
        match tokio::time::timeout(wait, join).await {
            Ok(_) => tracing::debug!(session = worker.session, "Download worker stopped"),
            Err(_) => tracing::warn!(session = worker.session, "Download worker did not stop in time"),
        }
    }
}

struct SessionJob {
    hub: Arc<dyn Hub>,
    cache: ModelCache,
    request: DownloadRequest,
    session: SessionHandle,
    cancel: CancelFlag,
    observer: Option<ProgressObserver>,
    state: Arc<Mutex<DownloadState>>,
}

impl SessionJob {
    async fn run(self) {
        let repo_id = self.request.repo_id.clone();
        tracing::info!(session = self.session.id(), repo_id = %repo_id, "Download started");

        let result = if self.cancel.is_cancelled() {
            Ok(SessionEnd::Cancelled)
        } else {
            self.download().await
        };

        match result {
            Ok(SessionEnd::Completed) => {
                tracing::info!(repo_id = %repo_id, "Download completed");
                self.publish(true, |s| {
                    s.phase = DownloadPhase::Completed;
                    s.bytes_done = s.bytes_done.max(s.bytes_total);
                });
            }
            Ok(SessionEnd::Cancelled) => {
                tracing::info!(repo_id = %repo_id, "Download cancelled");
                self.publish(true, |s| {
                    s.phase = DownloadPhase::Cancelled;
                    s.stop_unfinished();
                });
            }
            Err(e) if self.cancel.is_cancelled() => {
                tracing::info!(repo_id = %repo_id, error = %e, "Download cancelled during error");
                self.publish(true, |s| {
                    s.phase = DownloadPhase::Cancelled;
                    s.stop_unfinished();
                });
            }
            Err(e) => {
                tracing::error!(repo_id = %repo_id, error = %e, "Download failed");
                let message = e.to_string();
                self.publish(true, |s| {
                    s.phase = DownloadPhase::Error;
                    s.error = Some(message);
                    s.stop_unfinished();
                });
            }
        }
    }

    /// Apply an update and notify the observer if it landed
    fn publish<F>(&self, notify: bool, f: F)
    where
        F: FnOnce(&mut DownloadState),
    {
        if self.session.update(f) && notify {
            if let Some(observer) = &self.observer {
                let snapshot = self.state.lock().snapshot();
                observer(&snapshot);
            }
        }
    }

    async fn download(&self) -> Result<SessionEnd, DownloadError> {
        let repo_id = &self.request.repo_id;
        let manifest = self.hub.manifest(repo_id).await?;

        let files: Vec<_> = match &self.request.filenames {
            Some(wanted) => manifest
                .files
                .iter()
                .filter(|f| wanted.contains(&f.name))
                .cloned()
                .collect(),
            None => manifest.files.clone(),
        };
        if files.is_empty() {
            return Err(DownloadError::NoMatchingFiles(repo_id.clone()));
        }
        if self.cancel.is_cancelled() {
            return Ok(SessionEnd::Cancelled);
        }

        let snapshot_dir = self.cache.snapshot_dir(repo_id, &manifest.sha);
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        self.cache.write_ref(repo_id, &manifest.sha)?;

        let bytes_total = files.iter().map(|f| f.size).sum();
        self.publish(true, |s| {
            s.files = files.iter().map(FileProgress::from).collect();
            s.bytes_total = bytes_total;
            s.phase = DownloadPhase::Downloading;
        });

        let started = Instant::now();
        let mut throttle = Throttle::new(PROGRESS_INTERVAL);
        let mut completed: u64 = 0;
        let mut fetched_before: u64 = 0;

        for (idx, file) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }

            let dest = snapshot_dir.join(safe_relative_path(&file.name)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            self.publish(throttle.ready(true), |s| {
                s.current_idx = idx;
                s.files[idx].status = FileStatus::Downloading;
            });

            let outcome = transfer::transfer_file(
                self.hub.as_ref(),
                repo_id,
                &manifest.sha,
                file,
                &dest,
                &self.cancel,
                |file_bytes, fetched| {
                    if !throttle.ready(false) {
                        return;
                    }
                    let done = completed + file_bytes;
                    let speed = transfer::speed(fetched_before + fetched, started);
                    self.publish(true, |s| {
                        s.bytes_done = s.bytes_done.max(done);
                        s.speed = speed;
                    });
                },
            )
            .await?;

            match outcome {
                TransferOutcome::Cancelled => return Ok(SessionEnd::Cancelled),
                TransferOutcome::Done { fetched } => {
                    completed += file.size;
                    fetched_before += fetched;
                    let speed = transfer::speed(fetched_before, started);
                    throttle.ready(true);
                    self.publish(true, |s| {
                        s.files[idx].status = FileStatus::Done;
                        s.bytes_done = s.bytes_done.max(completed);
                        s.speed = speed;
                    });
                }
            }
        }

        Ok(SessionEnd::Completed)
    }
}
