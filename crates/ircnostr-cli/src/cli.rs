//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Bridge IRC channels and Nostr channels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "bridge.toml")]
    pub config: String,

    /// Seconds to wait for channels to be parted on shutdown
    #[arg(long)]
    pub grace_secs: Option<u64>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run every configured bridge until interrupted (default)
    Run,
    /// Validate the configuration and print each bridge's identity
    Check,
}
