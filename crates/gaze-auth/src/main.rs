use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gaze_core::Config;

mod camera;
mod outcome;
mod pipeline;
mod session;
mod snapshot;
mod ui;

use outcome::AuthOutcome;

/// Run one face-authentication attempt. The exit code is the contract
/// with the calling authentication framework; see `outcome.rs`.
#[derive(Parser)]
#[command(name = "gaze-auth", about = "Gaze verifier — one authentication attempt", version)]
struct Args {
    /// Username to authenticate.
    username: Option<String>,

    /// Path to the configuration file.
    #[arg(long, default_value = "/etc/gaze/config.toml")]
    config: PathBuf,
}

fn main() {
    // Logging goes to stderr; stdout is reserved for the end report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let Some(username) = args.username else {
        eprintln!("gaze-auth: missing username");
        std::process::exit(AuthOutcome::InvalidInvocation.exit_code());
    };

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration unusable");
            std::process::exit(AuthOutcome::InvalidInvocation.exit_code());
        }
    };

    let outcome = session::run_attempt(&username, &config);
    tracing::info!(?outcome, code = outcome.exit_code(), "attempt finished");
    std::process::exit(outcome.exit_code());
}
