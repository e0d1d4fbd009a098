//! IRC/Nostr bridge entry point

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use ircnostr_cli::app::{self, BridgeApp};
use ircnostr_cli::cli::{Cli, Commands};
use ircnostr_core::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("Loading configuration from: {}", cli.config);
    let config = AppConfig::load_from_file(&cli.config)
        .with_context(|| format!("Could not load configuration from {}", cli.config))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            let (lines, valid) = app::check(&config);
            for line in lines {
                println!("{}", line);
            }
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Run => {
            let grace = cli
                .grace_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.runtime.shutdown_grace());

            let mut app = BridgeApp::new(config);
            let started = app.start()?;
            info!("Running {} bridges, press Ctrl-C to stop", started);
            app.run_until_shutdown(grace).await?;
        }
    }

    info!("Bridge exited");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
