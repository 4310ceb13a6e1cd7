use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vault_operator::{
    config::load_config,
    contracts::ValidatorsRegistry,
    validators::{load_keystores, ApprovalRequest, DepositData, OracleConsensusClient},
    Oracles,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decrypt every keystore and print the loaded public keys
    VerifyKeystores,

    /// Build the validators tree from the configured deposit data
    DepositData {
        /// Write the tree dump to this file
        #[arg(long)]
        dump: Option<PathBuf>,
    },

    /// Collect oracle approvals for a prepared request
    RequestApprovals {
        /// Approval request JSON
        #[arg(long)]
        request: PathBuf,

        /// Oracle set JSON
        #[arg(long)]
        oracles: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let app_config = load_config(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::VerifyKeystores => {
            let keystores = load_keystores(&app_config.keystores).await?;
            println!("Loaded {} keystores", keystores.len());
            for public_key in keystores.public_keys() {
                println!("{}", public_key);
            }
        }
        Command::DepositData { dump } => {
            let deposit_data = DepositData::load(
                app_config.vault.address,
                &app_config.vault.deposit_data_file,
                app_config.vault.deposit_amount_gwei,
            )?;
            println!("Validators: {}", deposit_data.validators().len());
            println!("Root: {}", deposit_data.root());

            if let Some(path) = dump {
                let json = serde_json::to_string_pretty(&deposit_data.dump())?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write tree dump to {}", path.display()))?;
                info!("Tree dump written to {}", path.display());
            }
        }
        Command::RequestApprovals { request, oracles } => {
            let request: ApprovalRequest = read_json(&request)?;
            let oracles: Oracles = read_json(&oracles)?;
            oracles.validate()?;

            let registry = Arc::new(
                ValidatorsRegistry::new(
                    &app_config.execution.endpoint,
                    app_config.execution.validators_registry,
                )?
                .with_from_block(app_config.execution.deposits_from_block),
            );
            let mut client =
                OracleConsensusClient::new(registry.clone(), registry, &app_config.oracles);

            let approval = client.request_approvals(&oracles, &request).await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}
