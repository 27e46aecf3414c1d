mod commands;
mod config;
mod console;
mod conversation;
mod directory;
mod error;
mod events;
mod hub;
mod logging;
mod membership;
mod session;
mod streaming;
mod transport;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "cchat")]
#[command(version = "0.1.0")]
#[command(about = "Real-time chat with groups, private messages and an AI assistant", long_about = None)]
struct Cli {
    /// Config file (default: ~/.cchat/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hub for broadcast, private and group messaging
    #[arg(long, global = true)]
    hub_url: Option<String>,

    /// Hub for AI generation
    #[arg(long, global = true)]
    ai_url: Option<String>,

    /// Log filter when RUST_LOG is not set (e.g. info, debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?.with_overrides(
        cli.hub_url,
        cli.ai_url,
        cli.log_level,
    );

    match cli.command {
        Some(Commands::Config { write }) => {
            print!("{}", config.to_toml()?);
            if write {
                let path = match cli.config {
                    Some(path) => path,
                    None => Config::default_path()?,
                };
                config.save(&path)?;
                println!("💾 Saved to {}", path.display());
            }
            Ok(())
        }
        None => {
            logging::init_subscriber(&config.log_level);
            console::run(config).await
        }
    }
}
