//! Control-socket client
//!
//! Used by the CLI and by a starting daemon checking for a live predecessor.
//! Each request opens a fresh connection, writes one line and reads one line.

use super::protocol::{Command, Response};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Generation and loads can take minutes on CPU
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running ({0})")]
    NotRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    Protocol(String),

    #[error("Daemon closed the connection without replying")]
    Closed,

    #[error("{0}")]
    Daemon(String),
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send a typed command
    pub async fn request(&self, cmd: &Command) -> Result<Response, ClientError> {
        let value =
            serde_json::to_value(cmd).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.request_value(&value).await
    }

    /// Send a raw JSON object, letting the daemon validate it
    pub async fn request_value(&self, value: &Value) -> Result<Response, ClientError> {
        let line = value.to_string();
        tokio::time::timeout(self.timeout, self.round_trip(&line))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn round_trip(&self, line: &str) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    ClientError::NotRunning(self.socket.display().to_string())
                }
                _ => ClientError::Io(e),
            }
        })?;
        let (read, mut write) = stream.into_split();

        write.write_all(line.as_bytes()).await?;
        write.write_all(b"\n").await?;
        write.flush().await?;

        let mut reply = String::new();
        let n = BufReader::new(read).read_line(&mut reply).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        serde_json::from_str(reply.trim()).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Send a command and unwrap `data`, turning `ok:false` into an error
    pub async fn call(&self, cmd: &Command) -> Result<Value, ClientError> {
        let resp = self.request(cmd).await?;
        if resp.ok {
            Ok(resp.data.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Daemon(
                resp.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }

    /// True if a daemon answers `pong`
    pub async fn ping(&self) -> bool {
        matches!(
            self.call(&Command::Ping).await,
            Ok(Value::String(ref s)) if s == "pong"
        )
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call(&Command::GetStatus).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.call(&Command::Shutdown).await.map(|_| ())
    }
}
