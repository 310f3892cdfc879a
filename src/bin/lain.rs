//! Lain CLI - Command-line interface for the Lain chat agent
//!
//! Provides subcommands for initializing an agent root, running a session
//! against a chat server, and reading back the stored transcript.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lain::runtime::log::{HISTORY_COMMANDS, LogReader};
use lain::runtime::storage::{self, Storage};
use lain::{Runtime, RuntimeConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "lain")]
#[command(about = "Autonomous chat agent for IRC-style networks", long_about = None)]
#[command(version = lain::VERSION)]
struct Cli {
    /// Root directory for config and message log
    #[arg(short, long, default_value = ".lain")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file under the root directory
    Init {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Connect to the server and chat until disconnected or interrupted
    Run {
        /// Config file to use instead of `<root>/config.json`
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the stored transcript, oldest first
    History {
        /// Number of recent messages to show
        #[arg(short, long, default_value = "30")]
        limit: usize,

        /// Include every command, not just conversational ones
        #[arg(long)]
        all: bool,
    },
}

/// Settings that can be given on the command line instead of the config file
#[derive(Args)]
struct Overrides {
    /// Chat server host
    #[arg(long)]
    server: Option<String>,

    /// Chat server port
    #[arg(long)]
    port: Option<u16>,

    /// Nickname
    #[arg(long)]
    nick: Option<String>,

    /// Real name sent at registration
    #[arg(long)]
    realname: Option<String>,

    /// Username sent at registration
    #[arg(long)]
    username: Option<String>,

    /// Backend generate endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Backend model name
    #[arg(long)]
    model: Option<String>,

    /// Don't echo stored messages
    #[arg(long)]
    quiet: bool,
}

impl Overrides {
    fn apply(self, config: &mut RuntimeConfig) {
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(nick) = self.nick {
            config.nick = nick;
        }
        if let Some(realname) = self.realname {
            config.realname = realname;
        }
        if let Some(username) = self.username {
            config.username = username;
        }
        if let Some(endpoint) = self.endpoint {
            config.gateway.endpoint = endpoint;
        }
        if let Some(model) = self.model {
            config.gateway.model = model;
        }
        if self.quiet {
            config.echo = false;
        }
    }
}

/// Stored config if the root has one, defaults otherwise
fn config_for(root: &Path) -> Result<RuntimeConfig> {
    if Storage::new(root.to_path_buf()).config_path().exists() {
        Runtime::load_config(root.to_path_buf())
    } else {
        Ok(RuntimeConfig {
            root: root.to_path_buf(),
            ..RuntimeConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { overrides } => {
            let mut config = config_for(&cli.root)?;
            overrides.apply(&mut config);
            Runtime::init(config)?;
            println!("Initialized Lain at {:?}", cli.root);
        }

        Commands::Run { config, overrides } => {
            let mut config = match config {
                Some(path) => RuntimeConfig {
                    root: cli.root,
                    ..storage::load_config(&path)?
                },
                None => config_for(&cli.root)?,
            };
            overrides.apply(&mut config);
            Runtime::run(config).await?;
        }

        Commands::History { limit, all } => {
            // Read-only: a running agent may be appending to this file
            let log = LogReader::open(Storage::new(cli.root).log_path())?;

            let mut messages = if all {
                log.tail(limit)?
            } else {
                log.history(limit, HISTORY_COMMANDS)?
            };
            messages.reverse();

            for message in messages {
                let stamp = message
                    .timestamp
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "{:>6} {} {}",
                    message.sequence_id.unwrap_or_default(),
                    stamp,
                    message.transcript_line()
                );
            }
        }
    }

    Ok(())
}
