//! Array Controller - drives a set of serial-attached array boards
//!
//! Opens every configured port, waits for the boards to report ready, then
//! sends operator commands to all boards at once.

use array_controller::shell::{render_event, run_once, Shell};
use array_controller::{ControllerConfig, Reporter, Result, SessionManager};
use array_link::ArrayAddress;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "arrays.toml")]
    config: PathBuf,

    /// Serial port of an array, in array order (repeatable, replaces configured ports)
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dispatch a single command line and exit
    #[arg(short = 'e', long)]
    execute: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load or create configuration
    let mut config = if args.config.exists() {
        info!("Loading configuration from {:?}", args.config);
        ControllerConfig::load_from_file(&args.config)?
    } else {
        info!("Configuration file not found, creating default configuration");

        let config = ControllerConfig::default();
        config.save_to_file(&args.config)?;
        info!("Default configuration saved to {:?}", args.config);
        info!("Edit {:?} to list the array ports", args.config);

        config
    };

    // Override with CLI args if provided
    if !args.ports.is_empty() {
        config.ports = args.ports.into_iter().map(ArrayAddress::from).collect();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    config.validate()?;

    info!(arrays = config.ports.len(), baud_rate = config.baud_rate, "Array ports configured");

    let (reporter, progress) = Reporter::channel();
    let renderer = progress.spawn_renderer(|event| println!("{}", render_event(&event)));

    let manager = SessionManager::with_serial_ports(config, reporter)?;

    let outcome = if let Some(line) = args.execute {
        run_once(&manager, &line).await.map(|_| ())
    } else {
        match Shell::new(manager) {
            Ok(mut shell) => shell.run().await,
            Err(e) => Err(e),
        }
    };

    // Shell and run_once flush before returning
    renderer.abort();

    if let Err(e) = outcome {
        error!("{}", e);
        return Err(e);
    }

    Ok(())
}
