//! Hiera Node - hierarchical BFT ordering validator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hiera_msp::LocalAuthority;
use hiera_node::{init_logging, LogFormat, NodeConfig, NodeService};
use hiera_types::{Keypair, PublicKey, Role};
use std::path::PathBuf;

/// Hiera Node - permissioned multi-channel ordering
#[derive(Parser, Debug)]
#[command(name = "hiera-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a validator
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Log level override (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,

        /// Log format override (pretty, json)
        #[arg(long)]
        log_format: Option<String>,
    },

    /// Generate a new keypair
    Keygen,

    /// Issue an identity certificate and print it as YAML
    Issue {
        /// Issuing authority secret key (hex)
        #[arg(long)]
        authority_key: String,

        /// Subject public key (hex)
        #[arg(long)]
        subject: String,

        /// Role granted to the subject
        #[arg(long, value_enum, default_value_t = RoleArg::Endorser)]
        role: RoleArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Admin,
    Client,
    Endorser,
    Observer,
    Authority,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::Client => Role::Client,
            RoleArg::Endorser => Role::Endorser,
            RoleArg::Observer => Role::Observer,
            RoleArg::Authority => Role::Authority,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            log_level,
            log_format,
        } => run(config, log_level, log_format).await,
        Command::Keygen => {
            let keypair = Keypair::generate();
            println!("private_key: \"{}\"", keypair.secret_hex());
            println!("public_key: \"{}\"", keypair.public_key().to_hex());
            Ok(())
        }
        Command::Issue {
            authority_key,
            subject,
            role,
        } => {
            let authority = LocalAuthority::root(
                Keypair::from_secret_hex(&authority_key).context("invalid authority key")?,
            );
            let subject = PublicKey::from_hex(&subject).context("invalid subject key")?;
            let identity = authority.issue_role(subject, role.into());
            print!("{}", serde_yaml::to_string(&identity)?);
            Ok(())
        }
    }
}

async fn run(path: PathBuf, log_level: Option<String>, log_format: Option<String>) -> Result<()> {
    let mut config = NodeConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    if let Some(level) = log_level {
        config.log_level = level;
    }
    if let Some(format) = log_format {
        config.log_format = format;
    }

    init_logging(&config.log_level, LogFormat::parse(&config.log_format));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting hiera node");
    tracing::info!(
        listen = %config.listen,
        data_dir = %config.data_dir.display(),
        peers = config.peers.len(),
        channels = config.channels.len(),
        "node configuration"
    );

    let service = NodeService::start(&config).await?;
    tracing::info!(
        node = %service.node().public_key(),
        addr = %service.local_addr(),
        "node is ready, press Ctrl+C to stop"
    );

    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;
    tracing::info!("hiera node stopped");
    Ok(())
}
