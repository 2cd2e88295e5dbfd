mod approval;
mod client;
mod keygen;

use approval::ApprovalController;
use clap::{Parser, Subcommand};
use client::{ApprovalApi, BridgeClient};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "walletbridge-cli")]
#[command(about = "Operator CLI for WalletBridge: onboarding and approvals")]
struct Cli {
    /// Bridge base URL
    #[arg(long, env = "WALLETBRIDGE_URL", default_value = "http://127.0.0.1:8787")]
    url: String,

    /// Approval session token printed by the bridge at startup
    #[arg(long, env = "WALLETBRIDGE_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new mnemonic locally
    Keygen {
        #[arg(long, default_value_t = 24)]
        words: usize,
    },
    /// Store a mnemonic in the wallet and derive its accounts
    Init {
        #[arg(long, env = "WALLETBRIDGE_MNEMONIC", hide_env_values = true)]
        mnemonic: String,
        #[arg(long, default_value_t = 5)]
        accounts: u64,
    },
    /// Show wallet state (never the mnemonic)
    State,
    /// List all derived accounts
    Accounts,
    /// Make account `index` the active one
    UseAccount { index: u64 },
    /// Switch the active chain
    SwitchChain { chain_id: String },
    /// Register a network
    AddNetwork {
        #[arg(long)]
        chain_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        rpc_url: String,
        #[arg(long)]
        block_explorer: Option<String>,
    },
    /// List requests awaiting approval
    Pending,
    /// Inspect one pending request
    Show { id: u64 },
    /// Approve a pending request
    Approve { id: u64 },
    /// Reject a pending request
    Reject { id: u64 },
    /// Wipe the wallet back to defaults
    Reset,
}

fn print(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = BridgeClient::new(&cli.url, &cli.token);

    match cli.command {
        Commands::Keygen { words } => {
            println!("{}", keygen::generate_mnemonic(words)?);
        }
        Commands::Init { mnemonic, accounts } => {
            keygen::validate_mnemonic(&mnemonic)?;
            client.call("wallet_setMnemonic", vec![json!(mnemonic)]).await?;
            let derived = client
                .call("wallet_deriveAccounts", vec![json!(mnemonic), json!(accounts)])
                .await?;
            client.call("wallet_setAccounts", vec![derived.clone()]).await?;
            print(&derived);
        }
        Commands::State => print(&client.call("wallet_getState", vec![]).await?),
        Commands::Accounts => print(&client.call("wallet_getAllAccounts", vec![]).await?),
        Commands::UseAccount { index } => {
            client.call("wallet_setCurrentAccount", vec![json!(index)]).await?;
            print(&client.call("wallet_getAccounts", vec![]).await?);
        }
        Commands::SwitchChain { chain_id } => {
            client.call("wallet_setChainId", vec![json!(chain_id)]).await?;
            println!("Switched to {chain_id}");
        }
        Commands::AddNetwork {
            chain_id,
            name,
            rpc_url,
            block_explorer,
        } => {
            let network = json!({
                "chainId": chain_id,
                "name": name,
                "rpcUrl": rpc_url,
                "blockExplorer": block_explorer,
            });
            client.call("wallet_addNetwork", vec![network]).await?;
            println!("Added {name}");
        }
        Commands::Pending => {
            let pending = client.list_pending_requests().await?;
            if pending.is_empty() {
                println!("No pending requests");
            }
            for request in &pending {
                println!("{}\t{}\t{}", request.id, request.method, request.timestamp);
            }
        }
        Commands::Show { id } => {
            let request = client.pending_request(id).await?;
            println!("{}", approval::describe(&request));
        }
        Commands::Approve { id } => {
            let result = ApprovalController::new(&client).approve(id).await?;
            match result.into_result() {
                Ok(value) => print(&value),
                Err(err) => anyhow::bail!("approved but failed: {err}"),
            }
        }
        Commands::Reject { id } => {
            ApprovalController::new(&client).reject(id).await?;
            println!("Rejected {id}");
        }
        Commands::Reset => {
            client.call("wallet_reset", vec![]).await?;
            println!("Wallet reset");
        }
    }

    Ok(())
}
