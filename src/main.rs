//! AirQuality Hub CLI - registers device tokens and fans out air quality alerts.
//!
//! This is the main binary entry point. See the `airquality_hub` library
//! for the core functionality.

use airquality_hub::{config::Config, ensure_key_material, keys, server, TokenVault};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "airquality-hub")]
#[command(version)]
#[command(about = "Encrypted device token vault and air quality push alerts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print every registered device token
    Tokens,
    /// Rewrite the token log without duplicate or unreadable records
    Compact,
    /// Create key material if missing and print its location
    Keys,
    /// Write the effective configuration to config.json
    Config,
}

fn open_vault(config: &Config) -> Result<TokenVault> {
    let keys = ensure_key_material(&config.data_dir).context("Failed to initialize key material")?;
    TokenVault::open(config.token_log_path(), keys).context("Failed to load token vault")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(server::run(config))
        }
        Commands::Tokens => {
            let vault = open_vault(&config)?;
            println!("{} registered token(s):", vault.len());
            for token in vault.all() {
                println!("{}", token.as_str());
            }
            Ok(())
        }
        Commands::Compact => {
            let vault = open_vault(&config)?;
            let written = vault.compact()?;
            println!("Compacted {} to {written} record(s)", vault.path().display());
            Ok(())
        }
        Commands::Keys => {
            ensure_key_material(&config.data_dir).context("Failed to initialize key material")?;
            let (key_path, nonce_path) = keys::key_paths(&config.data_dir);
            println!("Key:   {}", key_path.display());
            println!("Nonce: {}", nonce_path.display());
            Ok(())
        }
        Commands::Config => {
            config.save().context("Failed to save config")?;
            println!("Saved {}", Config::config_dir()?.join("config.json").display());
            Ok(())
        }
    }
}
