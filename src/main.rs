//! llmd command line
//!
//! ```bash
//! llmd start                         # spawn the daemon in the background
//! llmd daemon --foreground           # run it here, logging to stderr too
//! llmd status
//! llmd send load_model --args '{"model_id": "TheBloke/Llama-2-7B-GGUF"}'
//! llmd stop
//! ```

use clap::{Parser, Subcommand};
use llmd::daemon::{logging, server, DaemonClient, DaemonContext, DaemonError, DaemonPaths};
use llmd::inference::NativeBackends;
use llmd::storage::huggingface::HfHub;
use llmd::storage::settings::load_settings;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

type CliResult = Result<ExitCode, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "llmd")]
#[command(version, about = "Local LLM serving daemon and control client")]
#[command(propagate_version = true)]
struct Cli {
    /// Per-user directory for socket, PID, log, config and keys
    #[arg(long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in this process
    Daemon {
        /// Also log to stderr
        #[arg(short, long)]
        foreground: bool,
    },

    /// Start the daemon in the background and wait until it answers
    Start {
        /// Seconds to wait for the first ping
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Ask the daemon to shut down
    Stop,

    /// Show daemon status
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the daemon answers
    Ping,

    /// Send any control command
    Send {
        /// Command name, e.g. load_model
        cmd: String,

        /// Arguments as a JSON object
        #[arg(short, long, value_name = "JSON")]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match DaemonPaths::resolve(cli.dir.as_deref()) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Daemon { foreground } => run_daemon(paths, foreground).await,
        Commands::Start { wait } => start_daemon(&paths, Duration::from_secs(wait)).await,
        Commands::Stop => stop_daemon(&paths).await,
        Commands::Status { json } => show_status(&paths, json).await,
        Commands::Ping => ping_daemon(&paths).await,
        Commands::Send { cmd, args } => send_command(&paths, &cmd, args.as_deref()).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn client(paths: &DaemonPaths) -> DaemonClient {
    DaemonClient::new(paths.socket())
}

// ==================== Daemon ====================

async fn run_daemon(paths: DaemonPaths, foreground: bool) -> CliResult {
    paths.ensure()?;
    let settings = load_settings(&paths.config_file());
    let log = logging::init(&paths.log_file(), &settings.log_level, foreground)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %paths.root().display(),
        "Starting llmd"
    );

    let hub = HfHub::new(None).map_err(DaemonError::from)?;
    let ctx = DaemonContext::new(paths, Arc::new(NativeBackends), Arc::new(hub), Some(log))?;

    if let Err(e) = server::serve(Arc::new(ctx)).await {
        tracing::error!(error = %e, "Daemon failed");
        return Err(e.into());
    }
    Ok(ExitCode::SUCCESS)
}

async fn start_daemon(paths: &DaemonPaths, wait: Duration) -> CliResult {
    let client = client(paths);
    if client.ping().await {
        println!("Daemon already running (PID {})", paths.read_pid().unwrap_or(0));
        return Ok(ExitCode::SUCCESS);
    }

    paths.ensure()?;
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--dir")
        .arg(paths.root())
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn()?;
    let pid = child.id();

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if client.ping().await {
            println!("Daemon started (PID {})", pid);
            return Ok(ExitCode::SUCCESS);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    eprintln!(
        "Daemon did not answer within {}s; see {}",
        wait.as_secs(),
        paths.log_file().display()
    );
    Ok(ExitCode::FAILURE)
}

async fn stop_daemon(paths: &DaemonPaths) -> CliResult {
    let client = client(paths);
    if !client.ping().await {
        println!("Daemon is not running");
        return Ok(ExitCode::SUCCESS);
    }

    client.shutdown().await?;
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if !paths.socket().exists() || !client.ping().await {
            println!("Daemon stopped");
            return Ok(ExitCode::SUCCESS);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    eprintln!("Daemon is still shutting down");
    Ok(ExitCode::FAILURE)
}

async fn show_status(paths: &DaemonPaths, json: bool) -> CliResult {
    let status = client(paths).status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    let field = |key: &str| match &status[key] {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    println!("Daemon:   {} (PID {}, up {}s)", field("daemon_phase"), field("pid"), field("uptime_secs"));
    println!(
        "Server:   {} on {}:{}",
        if status["server_running"] == true { "running" } else { "stopped" },
        field("server_host"),
        field("server_port")
    );
    if status["model_loaded"] == true {
        println!("Model:    {} ({})", field("model_id"), field("active_backend"));
    } else if !status["loading_model"].is_null() {
        println!("Model:    loading {}", field("loading_model"));
    } else {
        println!("Model:    none");
    }
    println!("Download: {}", if status["download_active"] == true { "active" } else { "idle" });
    Ok(ExitCode::SUCCESS)
}

async fn ping_daemon(paths: &DaemonPaths) -> CliResult {
    if client(paths).ping().await {
        println!("pong");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Daemon is not running");
        Ok(ExitCode::FAILURE)
    }
}

async fn send_command(paths: &DaemonPaths, cmd: &str, args: Option<&str>) -> CliResult {
    let mut request = match args {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err("--args must be a JSON object".into()),
        },
        None => Map::new(),
    };
    request.insert("cmd".to_string(), Value::String(cmd.to_string()));

    let resp = client(paths).request_value(&Value::Object(request)).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(if resp.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
