//! wsinfra CLI: workspace runtimes on pluggable infrastructure backends.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "wsinfra",
    version,
    about = "Workspace runtime control plane with pluggable infrastructure backends"
)]
struct Cli {
    /// Control-plane configuration file
    #[arg(long, global = true, default_value = "wsinfra.yaml")]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: wsinfra::cli::Commands,
}

/// `WSINFRA_LOG`, then `RUST_LOG`, then `-v`, then the configured level.
fn init_logging(verbose: bool, level: &str) {
    let filter = std::env::var("WSINFRA_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| {
            let level = if verbose { "debug" } else { level };
            EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = match wsinfra::core::config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(cli.verbose, &config.log.level);

    if let Err(e) = wsinfra::cli::dispatch(cli.command, &config) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
