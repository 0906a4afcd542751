use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pensieve_config::AppConfig;
use pensieve_vault::Vault;

#[derive(Debug, Parser)]
#[command(
    name = "pensieve",
    version,
    about = "Maintenance tool for a pensieve knowledge vault"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create any missing standard vault folders.
    Init,
    /// Verify the vault layout; exits non-zero when folders are missing.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let vault = Vault::from_config(&config).context("open vault")?;
    info!(root = %vault.root().display(), "using vault");

    match cli.command {
        Commands::Init => {
            let created = vault
                .layout()
                .create()
                .await
                .context("create vault layout")?;
            if created.is_empty() {
                println!("vault already initialized at {}", vault.root().display());
            } else {
                for folder in &created {
                    println!("created {folder}");
                }
                println!(
                    "initialized {} folder(s) at {}",
                    created.len(),
                    vault.root().display()
                );
            }
        }
        Commands::Check => {
            let report = vault.layout().validate().await;
            if !report.valid {
                let missing: Vec<String> = report.missing.iter().map(ToString::to_string).collect();
                bail!(
                    "vault at {} is missing: {} (run `pensieve init`)",
                    vault.root().display(),
                    missing.join(", ")
                );
            }
            println!("vault at {} is healthy", vault.root().display());
        }
    }

    Ok(())
}
