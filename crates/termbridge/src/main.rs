//! termbridge
//!
//! Serves an interactive shell over WebSocket, and attaches to one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use termbridge::client;
use termbridge::config::Config;
use termbridge::pidfile::{get_pid_file_path, get_server_pid, remove_pid_file, write_pid_file};
use termbridge::server::TerminalServer;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// termbridge - relays a shell on a pseudo-terminal over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the terminal server in the foreground
    Start {
        /// Address to listen on (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Shell to launch for each connection (overrides config)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,

        /// Write logs to this file instead of stderr
        #[arg(long, value_name = "FILE")]
        log_file: Option<PathBuf>,
    },

    /// Stop the running server
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for the server to exit
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show server status
    Status,

    /// Attach this terminal to a server
    Attach {
        /// Server URL (defaults to the configured listen address)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Start {
            bind,
            shell,
            log_file,
        } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(shell) = shell {
                config.session.shell = shell;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose, log_file.as_deref())?;

            if let Some(pid) = get_server_pid() {
                eprintln!("Error: termbridge already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing server, run:");
                eprintln!("  termbridge stop");
                std::process::exit(1);
            }

            run_server(config).await?;
        }
        Commands::Stop { force, timeout } => {
            let _guard = init_tracing(&config, cli.verbose, None)?;
            stop_server(force, Duration::from_secs(timeout)).await?;
        }
        Commands::Status => match get_server_pid() {
            Some(pid) => {
                println!("termbridge is running (PID: {})", pid);
                println!("  Listening on: {}", config.server.client_url()?);
            }
            None => {
                println!("termbridge is not running");
            }
        },
        Commands::Attach { url } => {
            // Logs would interleave with the remote terminal.
            let url = match url {
                Some(url) => url,
                None => config.server.client_url()?,
            };

            let code = match client::attach(&url).await {
                Ok(None) => 0,
                Ok(Some(notice)) => {
                    eprintln!("Server error: {}", notice);
                    1
                }
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            };
            // The stdin reader thread would otherwise keep the runtime alive.
            std::process::exit(code);
        }
    }

    Ok(())
}

/// Initializes tracing to stderr, or to `log_file` through a non-blocking writer.
fn init_tracing(
    config: &Config,
    verbose: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;

            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Runs the server until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = TerminalServer::bind(&config).await?;
    let addr = server.local_addr()?;

    let pid_path = get_pid_file_path();
    write_pid_file(&pid_path)?;

    tracing::info!(
        addr = %addr,
        path = %config.server.path,
        shell = %config.session.shell,
        max_sessions = config.server.max_sessions,
        "termbridge starting"
    );

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(server.run(shutdown.clone()));

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    let result = match serve.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
    };

    remove_pid_file(&pid_path);
    tracing::info!("termbridge stopped");
    result
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Signals the running server and waits for it to exit.
async fn stop_server(force: bool, timeout: Duration) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = get_server_pid() else {
        anyhow::bail!("termbridge is not running");
    };

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("Invalid PID: {}", pid))?;
    kill(Pid::from_raw(raw), signal)
        .map_err(|e| anyhow::anyhow!("Failed to signal termbridge (PID {}): {}", pid, e))?;
    println!("Sent {:?} to termbridge (PID {})", signal, pid);

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !termbridge::pidfile::is_process_running(pid) {
            // A killed server cannot remove its own PID file.
            let _ = std::fs::remove_file(get_pid_file_path());
            println!("termbridge stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!(
        "Timeout waiting for termbridge to exit ({}s)",
        timeout.as_secs()
    )
}
