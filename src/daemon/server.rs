//! Daemon lifecycle
//!
//! Startup refuses to run beside a live daemon, binds the control socket and
//! records the PID. The accept loop gives every connection its own task, and
//! shutdown runs once, whether a signal or the `shutdown` command asked for it.

use super::client::DaemonClient;
use super::dispatcher::DaemonContext;
use super::protocol::Response;
use super::{DaemonError, DaemonPhase};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

/// Largest accepted request line
pub const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail if another daemon answers on our socket; otherwise clear its leftovers
pub async fn check_existing(ctx: &DaemonContext) -> Result<(), DaemonError> {
    let paths = ctx.paths();
    let recorded = paths.read_pid();
    let socket = paths.socket();

    if socket.exists() {
        let client = DaemonClient::new(&socket).with_timeout(PING_TIMEOUT);
        if client.ping().await {
            return Err(DaemonError::AlreadyRunning(recorded.unwrap_or(0)));
        }
        tracing::info!(path = %socket.display(), "Removing stale socket");
        std::fs::remove_file(&socket)?;
    }

    if let Some(pid) = recorded {
        tracing::info!(pid, "Removing stale PID file");
        let _ = std::fs::remove_file(paths.pid_file());
    }
    Ok(())
}

pub struct DaemonServer {
    ctx: Arc<DaemonContext>,
    listener: UnixListener,
}

impl DaemonServer {
    /// Run the startup checks, bind the socket and write the PID file
    pub async fn bind(ctx: Arc<DaemonContext>) -> Result<Self, DaemonError> {
        ctx.set_phase(DaemonPhase::Starting);
        check_existing(&ctx).await?;

        let paths = ctx.paths();
        let socket = paths.socket();
        let listener = UnixListener::bind(&socket).map_err(|source| DaemonError::Bind {
            path: socket.display().to_string(),
            source,
        })?;
        std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600))?;
        std::fs::write(paths.pid_file(), std::process::id().to_string())?;

        tracing::info!(
            pid = std::process::id(),
            socket = %socket.display(),
            "Daemon listening"
        );
        Ok(Self { ctx, listener })
    }

    /// Serve until a signal or `shutdown`, then stop every service
    pub async fn run(self) -> Result<(), DaemonError> {
        let Self { ctx, listener } = self;

        let restore = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.auto_restore().await })
        };

        ctx.set_phase(DaemonPhase::Serving);
        let mut shutdown = ctx.shutdown_signal();
        let mut connections = JoinSet::new();
        let terminate = terminate_signal();
        tokio::pin!(terminate);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        connections.spawn(handle_connection(ctx, stream));
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut terminate => {
                    tracing::info!("Termination signal received");
                    break;
                }
            }
        }

        drop(listener);
        if tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tracing::warn!("Connections still open at shutdown, aborting them");
            connections.abort_all();
        }
        restore.abort();

        ctx.stop_services().await;

        let paths = ctx.paths();
        for path in [paths.socket(), paths.pid_file()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove file");
                }
            }
        }

        ctx.set_phase(DaemonPhase::Stopped);
        tracing::info!("Daemon stopped");
        Ok(())
    }
}

/// Bind and serve on the context's paths until shutdown
pub async fn serve(ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    DaemonServer::bind(ctx).await?.run().await
}

/// One request line in, one response line out
async fn handle_connection(ctx: Arc<DaemonContext>, stream: UnixStream) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let response = match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) if !line.ends_with('\n') && line.len() as u64 >= MAX_REQUEST_BYTES => {
            Response::error("Malformed request: too large")
        }
        Ok(_) => ctx.handle_line(&line).await,
        Err(e) => {
            tracing::debug!(error = %e, "Could not read request");
            Response::error(format!("Malformed request: {}", e))
        }
    };

    if let Err(e) = write.write_all(response.to_line().as_bytes()).await {
        tracing::debug!(error = %e, "Client went away before the reply");
        return;
    }
    let _ = write.shutdown().await;
}

/// Resolves on SIGTERM or SIGINT
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot watch SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
