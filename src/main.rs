//! Wallet engine CLI.
//!
//! # Architecture Overview
//!
//! ```text
//!   CLI command
//!       │
//!       ▼
//!   TransactionRouter ──────────────┬──────────────────────────┐
//!       │                           │                          │
//!       ▼                           ▼                          ▼
//!   ProtocolClient (TRON)      EvmSender (EOA)          SafeOrchestrator
//!       │                           │                          │
//!       ▼                           ▼                          │
//!   RateLimitedHttpClient      DeduplicatingRpcProvider ◄──────┘
//!       │                           │
//!       ▼                           ▼
//!   ReqwestTransport           HttpJsonRpc
//! ```
//!
//! The signing key is read from `WALLET_ENGINE_PRIVATE_KEY`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, B256, U256};
use clap::{Parser, Subcommand};
use serde::Serialize;

use wallet_engine::config::{load_config, EngineConfig};
use wallet_engine::evm::{
    erc20, DeduplicatingRpcProvider, EvmSender, HttpJsonRpc, NonceQueue, SafePendingTx, SafeQueue,
};
use wallet_engine::http::ReqwestTransport;
use wallet_engine::observability::logging::init_logging;
use wallet_engine::records::{ChainTarget, TransactionLog};
use wallet_engine::router::{AccountKind, SendIntent, StakeAction, StakeIntent, TransactionRouter};
use wallet_engine::saga::{FinanceSaga, StakeAmount};
use wallet_engine::tron::{ProtocolClient, Resource, TronAction, TronAddress, TronSession, VoteItem};
use wallet_engine::wallet::SigningKey;

type Router = TransactionRouter<ReqwestTransport, DeduplicatingRpcProvider<HttpJsonRpc<ReqwestTransport>>>;

#[derive(Parser)]
#[command(name = "wallet-engine")]
#[command(about = "TRON and EVM wallet transaction engine", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transaction history file, loaded before and saved after the command.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Pending Safe transactions file, loaded before and saved after the command.
    #[arg(long)]
    safe_queue: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an address between TRON and EVM formats
    Address { value: String },
    /// Show the addresses of the configured key
    Whoami,
    /// TRON operations
    #[command(subcommand)]
    Tron(TronCommand),
    /// EVM operations
    #[command(subcommand)]
    Evm(EvmCommand),
    /// Resolve pending transactions in the history file
    Poll,
}

#[derive(Subcommand)]
enum TronCommand {
    /// Balance and resources of an account (default: own account)
    Balance {
        address: Option<String>,
        /// TRC-20 contract to read a token balance from
        #[arg(long)]
        token: Option<String>,
    },
    /// Send TRX (amount in sun) or a TRC-20 token (amount in base units)
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: U256,
        #[arg(long)]
        token: Option<String>,
    },
    /// Stake TRX for a resource
    Stake {
        #[arg(long)]
        amount_sun: u64,
        #[arg(long, default_value = "ENERGY")]
        resource: Resource,
    },
    /// Start unstaking
    Unstake {
        #[arg(long)]
        amount_sun: u64,
        #[arg(long, default_value = "ENERGY")]
        resource: Resource,
    },
    /// Withdraw unstaked TRX whose waiting period has passed
    Withdraw,
    /// Claim voting rewards
    Claim,
    /// Vote for witnesses, given as ADDRESS=COUNT
    Vote {
        #[arg(required = true, value_parser = parse_vote)]
        votes: Vec<VoteItem>,
    },
    /// List witnesses known to the gateway
    Witnesses,
    /// Claim rewards, stake, and re-vote for previous witnesses
    Saga {
        /// Stake this much; omit to stake the full balance minus the reserve
        #[arg(long)]
        amount_sun: Option<u64>,
        #[arg(long)]
        resource: Option<Resource>,
    },
    /// Probe the gateway
    Health,
}

#[derive(Subcommand)]
enum EvmCommand {
    /// Native or token balance of an account (default: own account)
    Balance {
        address: Option<Address>,
        #[arg(long)]
        token: Option<Address>,
    },
    /// Send native currency or an ERC-20 token
    Send {
        #[arg(long)]
        to: Address,
        #[arg(long)]
        amount: U256,
        #[arg(long)]
        token: Option<Address>,
        /// Propose from this Safe instead of sending from the key's account
        #[arg(long)]
        safe: Option<Address>,
    },
    /// Show a Safe's owners, threshold and queued transactions
    Safe { address: Address },
    /// Add the key's signature to a queued Safe transaction
    Sign { safe_tx_hash: B256 },
    /// Execute a queued Safe transaction that has enough signatures
    Execute { safe_tx_hash: B256 },
}

fn parse_vote(value: &str) -> Result<VoteItem, String> {
    let (address, count) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ADDRESS=COUNT, got {}", value))?;
    Ok(VoteItem {
        address: address.parse()?,
        count: count.parse().map_err(|e| format!("bad vote count {}: {}", count, e))?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    init_logging(&config.observability);

    tracing::info!(
        gateway = %config.tron.gateway_url,
        rpc = %config.evm.rpc_url,
        chain_id = config.evm.chain_id,
        "Configuration loaded"
    );

    let log = match &cli.history {
        Some(path) => TransactionLog::load_from_file(path)?,
        None => TransactionLog::new(),
    };
    let queue = SafeQueue::new();
    if let Some(path) = cli.safe_queue.as_deref().filter(|p| p.exists()) {
        let pending: Vec<SafePendingTx> = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        queue.import(pending);
    }
    let stores = Stores { log, queue };

    match cli.command {
        Commands::Address { value } => convert_address(&value)?,
        Commands::Whoami => {
            let key = SigningKey::from_env()?;
            print_json(&serde_json::json!({
                "tron": key.tron_address().to_base58(),
                "evm": key.evm_address(),
            }))?;
        }
        Commands::Tron(command) => run_tron(command, &config, &stores).await?,
        Commands::Evm(command) => run_evm(command, &config, &stores).await?,
        Commands::Poll => {
            let router = build_router(&config, SigningKey::from_env()?, &stores).await?;
            let finalized = router.poll_pending().await;
            println!(
                "{} transaction(s) resolved, {} pending",
                finalized,
                stores.log.pending().len()
            );
        }
    }

    if let Some(path) = &cli.history {
        stores.log.save_to_file(path)?;
    }
    if let Some(path) = &cli.safe_queue {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &stores.queue.export())?;
    }
    Ok(())
}

/// Caller-owned state shared by every command.
struct Stores {
    log: TransactionLog,
    queue: SafeQueue,
}

fn convert_address(value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let address: TronAddress = match value.parse::<Address>() {
        Ok(evm) => TronAddress::from_evm(evm),
        Err(_) => value.parse()?,
    };
    print_json(&serde_json::json!({
        "base58": address.to_base58(),
        "hex": address.to_hex(),
        "evm": address.to_evm(),
    }))
}

fn tron_client(config: &EngineConfig) -> Result<Arc<ProtocolClient<ReqwestTransport>>, Box<dyn std::error::Error>> {
    let transport = ReqwestTransport::new(
        Duration::from_secs(config.tron.request_timeout_secs),
        config.tron.api_key.as_deref(),
    )?;
    Ok(Arc::new(ProtocolClient::new(transport, config)))
}

/// Sender for the configured chain; refuses a node serving another chain.
async fn evm_sender(
    config: &EngineConfig,
) -> Result<EvmSender<DeduplicatingRpcProvider<HttpJsonRpc<ReqwestTransport>>>, Box<dyn std::error::Error>> {
    let transport = ReqwestTransport::new(Duration::from_secs(config.evm.rpc_timeout_secs), None)?;
    let rpc = HttpJsonRpc::new(transport, config.evm.rpc_url.clone());
    let provider = DeduplicatingRpcProvider::new(rpc, &config.rpc_cache);
    let sender = EvmSender::new(Arc::new(provider), NonceQueue::new(), config);
    sender.verify_chain_id().await?;
    Ok(sender)
}

async fn build_router(
    config: &EngineConfig,
    key: SigningKey,
    stores: &Stores,
) -> Result<Router, Box<dyn std::error::Error>> {
    Ok(TransactionRouter::new(key, stores.log.clone())
        .with_tron(tron_client(config)?, config.tron.gateway_url.clone())
        .with_evm(evm_sender(config).await?, stores.queue.clone()))
}

async fn run_tron(
    command: TronCommand,
    config: &EngineConfig,
    stores: &Stores,
) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = config.tron.gateway_url.as_str();

    match command {
        TronCommand::Balance { address, token } => {
            let client = tron_client(config)?;
            let address = match address {
                Some(value) => value.parse::<TronAddress>()?,
                None => SigningKey::from_env()?.tron_address(),
            };
            if let Some(token) = token {
                let balance = client.get_token_balance(gateway, &token, &address).await?;
                print_json(&serde_json::json!({
                    "address": address,
                    "token": token,
                    "balance": balance.to_string(),
                }))?;
                return Ok(());
            }
            let account = client.get_account(gateway, &address).await?;
            let resources = client.get_account_resource(gateway, &address).await?;
            let reward = client.get_reward(gateway, &address).await?;
            let withdrawable = client
                .get_withdrawable_unfrozen(gateway, &address, now_ms())
                .await?;
            print_json(&serde_json::json!({
                "address": address,
                "balance_sun": account.balance,
                "votes": account.votes,
                "reward_sun": reward,
                "withdrawable_sun": withdrawable,
                "tron_power": resources.tron_power_limit,
                "energy_limit": resources.energy_limit,
                "net_limit": resources.net_limit + resources.free_net_limit,
            }))?;
        }
        TronCommand::Send { to, amount, token } => {
            let router = build_router(config, SigningKey::from_env()?, stores).await?;
            let intent = SendIntent {
                chain: ChainTarget::Tron,
                account: AccountKind::Eoa,
                to,
                amount,
                token,
                summary: None,
            };
            print_outcome(router.send(&intent).await?)?;
        }
        TronCommand::Stake { amount_sun, resource } => {
            stake(config, stores, StakeAction::Stake, amount_sun, resource).await?
        }
        TronCommand::Unstake { amount_sun, resource } => {
            stake(config, stores, StakeAction::Unstake, amount_sun, resource).await?
        }
        TronCommand::Withdraw => {
            stake(config, stores, StakeAction::WithdrawUnfrozen, 0, Resource::Energy).await?
        }
        TronCommand::Claim => stake(config, stores, StakeAction::ClaimReward, 0, Resource::Energy).await?,
        TronCommand::Vote { votes } => {
            let session = TronSession::new(tron_client(config)?, SigningKey::from_env()?, gateway);
            let result = session.execute(&TronAction::Vote { votes }).await?;
            print_json(&serde_json::json!({
                "txid": result.receipt.txid,
                "confirmation": result.confirmation,
            }))?;
        }
        TronCommand::Witnesses => {
            let witnesses = tron_client(config)?.get_node_witnesses(gateway).await?;
            print_json(witnesses.as_ref())?;
        }
        TronCommand::Saga { amount_sun, resource } => {
            let session = Arc::new(TronSession::new(
                tron_client(config)?,
                SigningKey::from_env()?,
                gateway,
            ));
            let mut saga = FinanceSaga::new(session, config);
            let stake = match amount_sun {
                Some(amount_sun) => StakeAmount::Fixed { amount_sun },
                None => StakeAmount::FullBalance,
            };
            let mut plan = saga.plan(stake);
            if let Some(resource) = resource {
                plan.resource = resource;
            }
            let report = saga.run(&plan).await;
            print_json(&report)?;
        }
        TronCommand::Health => {
            let healthy = tron_client(config)?.is_healthy(gateway).await;
            println!("{}: {}", gateway, if healthy { "healthy" } else { "unreachable" });
        }
    }
    Ok(())
}

async fn stake(
    config: &EngineConfig,
    stores: &Stores,
    action: StakeAction,
    amount_sun: u64,
    resource: Resource,
) -> Result<(), Box<dyn std::error::Error>> {
    let router = build_router(config, SigningKey::from_env()?, stores).await?;
    let intent = StakeIntent {
        action,
        amount_sun,
        resource,
    };
    print_outcome(router.stake(&intent).await?)
}

async fn run_evm(
    command: EvmCommand,
    config: &EngineConfig,
    stores: &Stores,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        EvmCommand::Balance { address, token } => {
            let sender = evm_sender(config).await?;
            let address = match address {
                Some(address) => address,
                None => SigningKey::from_env()?.evm_address(),
            };
            match token {
                None => {
                    let balance = erc20::native_balance(sender.rpc(), address).await?;
                    print_json(&serde_json::json!({ "address": address, "balance_wei": balance }))?;
                }
                Some(token) => {
                    let metadata = erc20::token_metadata(sender.rpc(), token).await?;
                    let balance = erc20::token_balance(sender.rpc(), token, address).await?;
                    print_json(&serde_json::json!({
                        "address": address,
                        "token": metadata,
                        "balance": balance,
                    }))?;
                }
            }
        }
        EvmCommand::Send {
            to,
            amount,
            token,
            safe,
        } => {
            let router = build_router(config, SigningKey::from_env()?, stores).await?;
            let account = match safe {
                Some(address) => AccountKind::Safe { address },
                None => AccountKind::Eoa,
            };
            let intent = SendIntent {
                chain: ChainTarget::Evm {
                    chain_id: config.evm.chain_id,
                },
                account,
                to: to.to_string(),
                amount,
                token: token.map(|t| t.to_string()),
                summary: None,
            };
            print_outcome(router.send(&intent).await?)?;
        }
        EvmCommand::Safe { address } => {
            let router = build_router(config, SigningKey::from_env()?, stores).await?;
            let orchestrator = router
                .safe(config.evm.chain_id)
                .ok_or("EVM chain not configured")?;
            let info = orchestrator.info(address).await?;
            print_json(&serde_json::json!({
                "info": info,
                "queued": orchestrator.queue().for_safe(address),
            }))?;
        }
        EvmCommand::Sign { safe_tx_hash } => {
            let key = SigningKey::from_env()?;
            let router = build_router(config, key.clone(), stores).await?;
            let orchestrator = router
                .safe(config.evm.chain_id)
                .ok_or("EVM chain not configured")?;
            let have = orchestrator.add_signature(&key, &safe_tx_hash).await?;
            println!("{} signature(s) collected for {}", have, safe_tx_hash);
        }
        EvmCommand::Execute { safe_tx_hash } => {
            let key = SigningKey::from_env()?;
            let router = build_router(config, key.clone(), stores).await?;
            let orchestrator = router
                .safe(config.evm.chain_id)
                .ok_or("EVM chain not configured")?;
            let mut execution = orchestrator.execute(&key, &safe_tx_hash).await?;
            let outcome = orchestrator.confirm_execution(&mut execution).await;
            print_json(&serde_json::json!({
                "tx_hash": execution.tx_hash,
                "phase": execution.phase,
                "confirmation": outcome,
            }))?;
        }
    }
    Ok(())
}

fn print_outcome(outcome: wallet_engine::RouteOutcome) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        wallet_engine::RouteOutcome::Submitted(record) => print_json(&record),
        wallet_engine::RouteOutcome::AwaitingSignatures {
            safe_tx_hash,
            have,
            need,
        } => print_json(&serde_json::json!({
            "safe_tx_hash": safe_tx_hash,
            "signatures": have,
            "threshold": need,
        })),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
