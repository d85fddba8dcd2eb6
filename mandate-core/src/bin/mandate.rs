//! Mandate operator CLI - inspect and revoke local delegations and agents.

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mandate::rpc::{HttpJsonRpc, RpcChainReader};
use mandate::{DelegationStore, EngineConfig, NonceRevocationTracker, RetryExecutor};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mandate")]
#[command(about = "Scoped EVM delegations for trading agents", long_about = None)]
struct Cli {
    /// Engine configuration (YAML). MANDATE_* variables override it.
    #[arg(short, long, default_value = "mandate.yaml", global = true)]
    config: PathBuf,

    /// Store directory. Skips loading the configuration for local commands.
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored delegations
    Delegations,

    /// List agents
    Agents,

    /// Forget a delegation locally (it stays valid on chain until its caveats stop it)
    RevokeDelegation {
        /// Delegation hash (0x-prefixed)
        hash: B256,
    },

    /// Revoke an agent and forget its sub-delegation
    RevokeAgent {
        /// Agent id (agt_...)
        agent_id: String,
    },

    /// Read a delegator's revocation nonce and print the call that bumps it
    Nonce {
        /// Delegator account
        delegator: Address,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Delegations => {
            let store = open_store(&cli)?;
            let now = Utc::now();
            let records = store.list_delegations()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                eprintln!("No delegations stored");
            }
            for r in records {
                println!(
                    "{}  {:<14} {} -> {}  calls={}  expires={}{}",
                    r.delegation_hash,
                    r.kind.label(),
                    r.signed_delegation.delegator(),
                    r.signed_delegation.delegate(),
                    r.max_calls,
                    r.expires_at.format("%Y-%m-%d %H:%M"),
                    if r.is_expired(now) { "  (expired)" } else { "" }
                );
            }
        }

        Commands::Agents => {
            let store = open_store(&cli)?;
            let agents = store.list_agents()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
                return Ok(());
            }
            if agents.is_empty() {
                eprintln!("No agents");
            }
            for a in agents {
                println!(
                    "{}  {:<17} {:<9} trades={}/{}  errors={}  expires={}",
                    a.agent_id,
                    a.archetype,
                    a.status,
                    a.trades.executed,
                    a.trades.max_allowed,
                    a.errors.len(),
                    a.expires_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }

        Commands::RevokeDelegation { hash } => {
            let store = open_store(&cli)?;
            if store.revoke_delegation(*hash)? {
                println!("Revoked {hash}");
            } else {
                eprintln!("No delegation {hash}");
                std::process::exit(1);
            }
        }

        Commands::RevokeAgent { agent_id } => {
            let store = open_store(&cli)?;
            let agent = store.revoke_agent(agent_id)?;
            println!("{} is {}", agent.agent_id, agent.status);
        }

        Commands::Nonce { delegator } => {
            let config = EngineConfig::load(&cli.config)?;
            let transport = HttpJsonRpc::new(config.rpc_url.clone(), config.request_timeout())?;
            let reader = RpcChainReader::new(
                Arc::new(transport),
                RetryExecutor::new(config.retry_policy()),
            );
            let tracker = NonceRevocationTracker::new(
                Arc::new(reader),
                config.enforcers.nonce,
                config.delegation_manager,
            );
            let nonce = tracker.current_nonce(*delegator).await?;
            let bump = tracker.increment_nonce_execution();
            println!("nonce: {nonce}");
            println!("revoke all: call {} with data {}", bump.target, bump.call_data);
        }
    }

    Ok(())
}

fn open_store(cli: &Cli) -> Result<DelegationStore, Box<dyn std::error::Error>> {
    let dir = match &cli.store_dir {
        Some(dir) => dir.clone(),
        None => EngineConfig::load(&cli.config)?.store_dir,
    };
    Ok(DelegationStore::open(dir)?)
}
