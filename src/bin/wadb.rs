//! `wadb` - run shell commands and pair keys against the local wireless
//! debugging daemon.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wadb_rs::{AdbConfig, AdbManager, FileKeyStore, MdnsBrowser};

#[derive(Parser, Debug)]
#[command(name = "wadb", version, about = "Wireless ADB client")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "WADB_CONFIG")]
    config: Option<PathBuf>,

    /// Where the RSA key and pairing state are kept
    #[arg(long, env = "WADB_KEY_FILE", default_value = "adbkey.json")]
    key_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a shell command and print its output
    Shell {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Pair using a known pairing port
    Pair { port: u16, code: String },
    /// Pair, finding the pairing port over mDNS
    PairDiscover { code: String },
    /// Report whether the daemon accepts our key
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AdbConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AdbConfig::default(),
    };

    let store = Arc::new(FileKeyStore::new(&cli.key_file));
    let browser = Arc::new(MdnsBrowser::new().context("starting mDNS")?);
    let manager = AdbManager::new(config, store, browser);

    match cli.command {
        Commands::Shell { command } => {
            let output = manager.execute_command(&command.join(" ")).await?;
            print!("{}", output);
        }
        Commands::Pair { port, code } => {
            manager.pair(port, &code).await?;
            println!("Paired");
        }
        Commands::PairDiscover { code } => {
            manager.pair_with_code(&code).await?;
            println!("Paired");
        }
        Commands::Status => {
            let paired = manager.is_paired().await;
            println!(
                "paired: {}, recorded locally: {}",
                paired,
                manager.key_store().is_paired()
            );
        }
    }

    Ok(())
}
