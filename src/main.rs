//! markroute daemon entry point
//!
//! ```bash
//! # Run with the default configuration path
//! sudo markroute
//!
//! # Run with a custom configuration
//! sudo markroute -c /path/to/config.json
//!
//! # Validate a configuration without starting
//! markroute -c /path/to/config.json --check
//! ```

use std::path::PathBuf;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use markroute::config::load_config;
use markroute::state::{load_or_create_secret, PidFile};
use markroute::App;

const DEFAULT_CONFIG_PATH: &str = "/etc/markroute/config.json";
const STATE_DIR: &str = "/var/lib/markroute";
const RUN_DIR: &str = "/run/markroute";

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Validate the configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("markroute v{}", markroute::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"markroute v{}

Policy-based routing daemon driven by observed DNS.

USAGE:
    markroute [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file [default: {DEFAULT_CONFIG_PATH}]
        --check            Validate the configuration and exit
    -v, --version          Print version
    -h, --help             Print help",
        markroute::VERSION
    );
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("markroute={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    if args.check_config {
        println!("configuration ok");
        return Ok(());
    }

    init_logging(&config.log_level);
    info!(version = markroute::VERSION, "starting markroute");

    let _pid_file = PidFile::acquire(RUN_DIR.as_ref(), "markroute")
        .context("acquiring pid file")?;
    if let Err(err) = load_or_create_secret(STATE_DIR.as_ref()) {
        warn!(%err, "failed to prepare signing secret, management API auth unavailable");
    }

    let groups = config.groups.clone();
    let app = App::new(config);
    for model in groups {
        app.add_group(model).context("registering group")?;
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        signal_token.cancel();
    });

    if let Err(err) = app.start(token).await {
        error!(%err, "core exited with error");
        return Err(err.into());
    }
    info!("shutdown complete");
    Ok(())
}
