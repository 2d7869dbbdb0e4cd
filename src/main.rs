use clap::Parser;
use connsniff::configuration::config::Config;
use connsniff::controller::controller_handler::Controller;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "connsniff")]
#[command(version = "0.0.2")]
#[command(about = "Peeks at the first bytes of every connection, then relays it untouched")]
struct Args {
    /// Path to the TOML configuration file
    config_file: PathBuf,

    /// Overrides `listen_address` from the configuration file
    #[arg(long, env = "CONNSNIFF_LISTEN")]
    listen: Option<String>,

    /// Overrides `upstream_address` from the configuration file
    #[arg(long, env = "CONNSNIFF_UPSTREAM")]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration from {}", args.config_file.display());

    let mut config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.apply_overrides(args.listen, args.upstream) {
        error!("Invalid command-line override: {}", e);
        std::process::exit(1);
    }

    info!(
        "Relaying {} -> {} after sniffing {} bytes",
        config.listen_address, config.upstream_address, config.sniff_bytes
    );

    if let Err(e) = Controller::new(config).run().await {
        error!("Error occured in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}
