// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use fieldcam::{Config, SessionMode};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "fieldcam")]
#[command(about = "Motion-triggered camera capture service")]
#[command(version = fieldcam::VERSION)]
struct Cli {
    /// Config file (default: ~/.config/fieldcam/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture service until interrupted
    Run {
        /// Use a simulated camera playing this image directory, GIF or video
        #[arg(short, long)]
        simulate: Option<PathBuf>,

        /// Session to start immediately (photo, video, timelapse)
        #[arg(long)]
        session: Option<SessionMode>,

        /// Also set the system clock when a client synchronises time
        #[arg(long)]
        set_system_clock: bool,
    },

    /// Take a single photo
    Photo {
        #[arg(short, long)]
        simulate: Option<PathBuf>,

        /// Output file (default: the configured photos directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Start the camera, print its status as JSON and stop
    Status {
        #[arg(short, long)]
        simulate: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    // A broken config still gets logged at the default level
    let config = Config::load(&config_path);
    let log_level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    // RUST_LOG overrides the configured level, e.g. RUST_LOG=fieldcam=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let config = config?;

    match cli.command {
        Commands::Run {
            simulate,
            session,
            set_system_clock,
        } => cli::run(config, &config_path, simulate, session, set_system_clock)?,
        Commands::Photo { simulate, output } => cli::take_photo(config, simulate, output)?,
        Commands::CheckConfig => cli::check_config(&config, &config_path)?,
        Commands::Status { simulate } => cli::print_status(config, simulate)?,
    }
    Ok(())
}
