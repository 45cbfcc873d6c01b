//! Single-file transfer
//!
//! Streams one hub file into `<name>.incomplete`, resuming from whatever is
//! already on disk, and renames it into place once complete.

use crate::download::cancel::CancelFlag;
use crate::download::DownloadError;
use crate::storage::huggingface::{Hub, RepoFile};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Minimum spacing between progress publications
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Floor for the elapsed time used in speed estimates
pub const MIN_SPEED_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// File is in place; `fetched` bytes came over the network this time
    Done { fetched: u64 },
    Cancelled,
}

/// Rate limiter for progress callbacks
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when enough time has passed, or always when `force` is set
    pub fn ready(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if force || due {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Transfer speed in bytes/s with a floor on elapsed time
pub fn speed(bytes: u64, started: Instant) -> f64 {
    let elapsed = started.elapsed().max(MIN_SPEED_WINDOW);
    bytes as f64 / elapsed.as_secs_f64()
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".incomplete");
    PathBuf::from(name)
}

/// Download `file` to `dest`.
///
/// `on_chunk(file_bytes, fetched)` runs after every chunk with the bytes of
/// this file now on disk and the bytes fetched over the network so far.
/// Cancellation abandons the in-flight read and keeps the partial file.
pub async fn transfer_file<F>(
    hub: &dyn Hub,
    repo_id: &str,
    revision: &str,
    file: &RepoFile,
    dest: &Path,
    cancel: &CancelFlag,
    mut on_chunk: F,
) -> Result<TransferOutcome, DownloadError>
where
    F: FnMut(u64, u64),
{
    if let Ok(meta) = fs::metadata(dest).await {
        if meta.is_file() && meta.len() == file.size {
            tracing::debug!(file = %file.name, "Already cached, skipping");
            on_chunk(file.size, 0);
            return Ok(TransferOutcome::Done { fetched: 0 });
        }
    }

    let partial = partial_path(dest);
    let mut offset = match fs::metadata(&partial).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if file.size > 0 && offset > file.size {
        offset = 0;
    }

    let response = hub.fetch(repo_id, revision, &file.name, offset).await?;
    if offset > 0 && !response.resumed {
        tracing::info!(file = %file.name, "Hub ignored range request, restarting file");
        offset = 0;
    } else if offset > 0 {
        tracing::info!(file = %file.name, offset, "Resuming partial file");
    }

    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .append(offset > 0)
        .truncate(offset == 0)
        .open(&partial)
        .await?;

    let mut stream = response.stream;
    let mut written = offset;
    let mut fetched = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                out.flush().await?;
                tracing::info!(file = %file.name, written, "Transfer cancelled");
                return Ok(TransferOutcome::Cancelled);
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    out.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                    fetched += bytes.len() as u64;
                    on_chunk(written, fetched);
                }
                Some(Err(e)) => {
                    out.flush().await?;
                    return Err(e.into());
                }
                None => break,
            }
        }
    }

    out.flush().await?;
    drop(out);

    if file.size > 0 && written != file.size {
        return Err(DownloadError::Incomplete {
            name: file.name.clone(),
            got: written,
            expected: file.size,
        });
    }

    fs::rename(&partial, dest).await?;
    Ok(TransferOutcome::Done { fetched })
}
