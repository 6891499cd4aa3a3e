use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ballbot_runtime::config::{BallbotConfig, SERIAL_BAUDRATE, SERIAL_PORT};
use ballbot_runtime::runtime::{self, RunOptions};

/// Ball-bot stability controller
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Trial number, used to name the data log
    #[arg(short, long)]
    trial: u32,

    /// Directory for data logs
    #[arg(long, default_value = "./pid_data")]
    log_dir: PathBuf,

    /// Serial port of the motor control board
    #[arg(short, long, default_value = SERIAL_PORT)]
    port: String,

    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    baudrate: u32,

    /// JSON file overriding gains and other constants
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fade-out time in seconds after the first stop signal (overrides config)
    #[arg(long)]
    fade: Option<f64>,

    /// Print loop timing statistics on exit
    #[arg(long)]
    report: bool,

    /// Run without the zenoh yaw teleop
    #[arg(long)]
    no_teleop: bool,
}

fn load_config(args: &Args) -> Result<BallbotConfig, ballbot_runtime::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => BallbotConfig::from_file(path)?,
        None => BallbotConfig::default(),
    };
    if let Some(fade) = args.fade {
        config.fade_time = fade;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init(); // installs the subscriber globally

    let args = Args::parse();

    // Bad constants must stop us before any I/O happens
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let options = RunOptions {
        port: args.port,
        baudrate: args.baudrate,
        log_path: args
            .log_dir
            .join(format!("ballbot_stability_test_{}.csv", args.trial)),
        config,
        teleop: !args.no_teleop,
        report: args.report,
    };

    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
