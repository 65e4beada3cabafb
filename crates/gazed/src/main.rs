use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::fcntl::{Flock, FlockArg};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use gaze_core::Config;

mod cache;
mod models;
mod server;
mod service;

use models::ModelStack;
use service::ModelService;

#[derive(Parser)]
#[command(name = "gazed", about = "Gaze model daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "/etc/gaze/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(&args.config)?;

    tracing::info!("gazed starting");

    // Preload is synchronous and fail-fast: a daemon without its models
    // must never reach the accept loop.
    let load_started = Instant::now();
    let stack = ModelStack::load(&config.daemon.model_dir, config.core.use_cnn)
        .context("model preload failed")?;
    let startup = load_started.elapsed();
    tracing::info!(
        elapsed_ms = startup.as_millis() as u64,
        use_cnn = config.core.use_cnn,
        "models loaded"
    );

    let _pid_lock = acquire_pid_lock(&config.daemon.pid_path)?;

    let listener = bind_socket(&config.daemon.socket_path)?;
    let service = Arc::new(ModelService::new(
        stack,
        config.daemon.user_dir.clone(),
        startup,
    ));

    tracing::info!(socket = %config.daemon.socket_path.display(), "gazed ready");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        result = server::run(Arc::clone(&service), listener) => {
            result.context("accept loop failed")?;
        }
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        _ = sigint.recv() => tracing::info!("SIGINT received"),
    }

    tracing::info!("gazed shutting down");
    std::fs::remove_file(&config.daemon.socket_path).ok();
    std::fs::remove_file(&config.daemon.pid_path).ok();
    Ok(())
}

/// Bind the well-known socket, replacing a stale file from a crashed run,
/// and restrict it to the owner before anyone can connect.
fn bind_socket(path: &Path) -> Result<tokio::net::UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if path.exists() {
        tracing::warn!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))?;
    Ok(listener)
}

/// Take the exclusive pid lock and record our pid in it. A second daemon
/// instance fails here instead of fighting over the socket.
fn acquire_pid_lock(path: &Path) -> Result<Flock<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open pid file {}", path.display()))?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, errno)) => bail!(
            "another gazed instance holds the pid lock at {} ({errno})",
            path.display()
        ),
    };
    lock.set_len(0)
        .with_context(|| format!("failed to truncate pid file {}", path.display()))?;
    writeln!(&*lock, "{}", std::process::id())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(lock)
}
