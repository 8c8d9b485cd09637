//! # chat-cli
//!
//! CLI tool for exercising the chatsync engine.
//!
//! ## Commands
//!
//! - `demo`: Run a send/confirm round trip against a scripted loopback server
//! - `config`: Print (and optionally validate) the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Print the defaults
//! chat-cli config
//!
//! # Check a config file
//! chat-cli --config chat.toml config --validate
//!
//! # Send "ping" to user 7 as user 1 and wait for the server copy
//! chat-cli demo --receiver 7 --content ping
//!
//! # Same, with a dropped connection along the way
//! RUST_LOG=chat_client=debug chat-cli demo --simulate-drop
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chat_client::ClientConfig;

mod commands;

use commands::{config, demo};

/// CLI tool for exercising the chatsync engine.
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a send/confirm round trip over a mock transport
    Demo {
        /// Our user id
        #[arg(long, default_value = "1")]
        user_id: u64,

        /// Recipient user id
        #[arg(long, short, default_value = "7")]
        receiver: u64,

        /// Message text
        #[arg(long, default_value = "ping")]
        content: String,

        /// Drop the connection once and show the client recovering
        #[arg(long)]
        simulate_drop: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Fail if the configuration is invalid
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client_config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            user_id,
            receiver,
            content,
            simulate_drop,
        } => {
            demo::run(client_config, user_id, receiver, &content, simulate_drop).await?;
        }
        Commands::Config { validate } => {
            config::run(&client_config, validate)?;
        }
    }

    Ok(())
}
