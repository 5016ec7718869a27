//! tabgate coordinator daemon
//!
//! Discovers browser-extension peers on a port range and arbitrates their
//! access to tabs.
//!
//! # Usage
//!
//! ```bash
//! # Start the coordinator (foreground)
//! tabgated start
//!
//! # Start in the background
//! tabgated start -d
//!
//! # Stop the running coordinator
//! tabgated stop
//!
//! # Print the effective configuration
//! tabgated --port-start 9000 --port-end 9010 config
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tabgate_core::TabgateConfig;
use tabgated::registry::tcp_connector;
use tabgated::router::HandlerRegistry;
use tabgated::session::NoopBackend;
use tabgated::Coordinator;

/// How long `stop` waits for the coordinator to exit.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// tabgate coordinator - shared, exclusive access to browser tabs
#[derive(Parser, Debug)]
#[command(name = "tabgated", version, about)]
struct Args {
    /// Configuration file (defaults to $TABGATE_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// First port of the discovery range
    #[arg(long, global = true)]
    port_start: Option<u16>,

    /// Last port of the discovery range
    #[arg(long, global = true)]
    port_end: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the coordinator
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running coordinator
    Stop,
    /// Show coordinator status
    Status,
    /// Print the effective configuration as TOML
    Config,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tabgate")
}

fn log_file_path() -> PathBuf {
    state_dir().join("tabgated.log")
}

/// The coordinator's PID file. Holding one means this process is the
/// running coordinator; dropping it removes the file.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn path() -> PathBuf {
        state_dir().join("tabgated.pid")
    }

    /// PID of a live coordinator, clearing a leftover file from a dead one.
    fn running() -> Option<u32> {
        let path = Self::path();
        let pid: u32 = fs::read_to_string(&path).ok()?.trim().parse().ok()?;
        if signal(pid, 0).is_ok() {
            return Some(pid);
        }
        let _ = fs::remove_file(&path);
        None
    }

    fn claim() -> Result<Self> {
        if let Some(pid) = Self::running() {
            bail!("Coordinator is already running (PID {pid}); use 'tabgated stop' first");
        }

        let path = Self::path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Sends `sig` to `pid`; signal 0 only checks that the process exists.
#[cfg(unix)]
fn signal(pid: u32, sig: i32) -> Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        bail!("Invalid PID {pid}");
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(raw, sig) } != 0 {
        bail!("Signal {sig} to process {pid} failed");
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal(_pid: u32, _sig: i32) -> Result<()> {
    bail!("Process signals are only supported on Unix systems")
}

/// Asks the coordinator to shut down and waits for it to exit.
fn stop_coordinator(pid: u32, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    signal(pid, libc::SIGTERM)?;
    #[cfg(not(unix))]
    signal(pid, 0)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if signal(pid, 0).is_err() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("Coordinator (PID {pid}) did not stop within {}s", grace.as_secs())
}

/// Loads the configuration, then applies command-line overrides.
fn load_config(args: &Args) -> Result<TabgateConfig> {
    let mut config =
        TabgateConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = args.port_start {
        config.port_start = port;
    }
    if let Some(port) = args.port_end {
        config.port_end = port;
    }
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if daemon {
                if let Some(pid) = PidFile::running() {
                    bail!("Coordinator is already running (PID {pid}); use 'tabgated stop' first");
                }
                daemonize(&log_file_path())?;
            }

            let _pid_file = PidFile::claim()?;
            run_coordinator(config)
        }
        Command::Stop => {
            let Some(pid) = PidFile::running() else {
                println!("Coordinator is not running.");
                return Ok(());
            };

            println!("Stopping coordinator (PID {pid})...");
            stop_coordinator(pid, STOP_GRACE)?;
            println!("Coordinator stopped.");
            Ok(())
        }
        Command::Status => {
            let Some(pid) = PidFile::running() else {
                println!("Coordinator is not running.");
                process::exit(1);
            };

            println!("Coordinator is running (PID {pid})");
            println!("Port range: {}-{}", config.port_start, config.port_end);
            println!("Log: {}", log_file_path().display());
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
    }
}

fn daemonize(log_path: &Path) -> Result<()> {
    use daemonize::Daemonize;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_coordinator(config: TabgateConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tabgated=info".parse()?)
                .add_directive("tabgate_core=info".parse()?)
                .add_directive("tabgate_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        host = %config.host,
        port_start = config.port_start,
        port_end = config.port_end,
        "tabgate coordinator starting"
    );

    let coordinator = Coordinator::spawn(
        &config,
        tcp_connector(&config),
        Arc::new(NoopBackend),
        HandlerRegistry::new(),
    );

    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "Error waiting for shutdown signal");
    }
    info!("Shutdown signal received");

    coordinator.shutdown().await;

    info!("tabgate coordinator stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_signal_zero_sees_own_process() {
        assert!(signal(process::id(), 0).is_ok());
    }

    #[test]
    fn test_signal_rejects_out_of_range_pid() {
        let err = signal(u32::MAX, 0).unwrap_err();
        assert!(err.to_string().contains("Invalid PID"));
    }
}
