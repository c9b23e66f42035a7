use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pool::{Address, ChainParams, PaymentMethod, PaymentMgr, PaymentMgrConfig, PoolStore};

mod client;

use client::{NodeClient, WalletClient};

#[derive(Parser, Debug)]
#[command(name = "poold", about = "Hegemon mining pool payment daemon")]
struct Cli {
    #[arg(long, default_value = "pool.kv")]
    db_path: PathBuf,
    #[arg(long, default_value = "mainnet", help = "Network to pay out on")]
    network: String,
    #[arg(long, default_value = "pps", help = "Reward scheme (pps or pplns)")]
    payment_method: String,
    #[arg(long, default_value_t = 0.01)]
    pool_fee: f64,
    #[arg(long, default_value_t = 86_400, help = "PPLNS share window in seconds")]
    last_n_period_secs: u64,
    #[arg(long, default_value_t = false)]
    solo_pool: bool,
    #[arg(
        long,
        required = true,
        help = "Pool fee payout address; repeat for multiple"
    )]
    pool_fee_addr: Vec<String>,
    #[arg(long, default_value_t = 0)]
    wallet_account: u32,
    #[arg(long, env = "POOLD_WALLET_PASSPHRASE")]
    wallet_pass: String,
    #[arg(long, default_value_t = 360)]
    coinbase_conf_timeout_secs: u64,
    #[arg(long, default_value = "ws://127.0.0.1:9944")]
    node_rpc: String,
    #[arg(long, default_value = "ws://127.0.0.1:9955")]
    wallet_rpc: String,
    #[arg(long, default_value_t = 60)]
    dividend_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let chain = ChainParams::from_name(&cli.network)?;
    let payment_method: PaymentMethod = cli.payment_method.parse()?;
    let pool_fee_addrs = cli
        .pool_fee_addr
        .iter()
        .map(|addr| Address::decode(addr, &chain))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid pool fee address")?;

    let db = Arc::new(PoolStore::open(&cli.db_path, cli.solo_pool)?);
    let mgr = Arc::new(PaymentMgr::new(
        db,
        PaymentMgrConfig {
            chain,
            pool_fee: cli.pool_fee,
            last_n_period: Duration::from_secs(cli.last_n_period_secs),
            solo_pool: cli.solo_pool,
            payment_method,
            pool_fee_addrs,
            wallet_account: cli.wallet_account,
            wallet_pass: cli.wallet_pass.clone(),
            coinbase_conf_timeout: Duration::from_secs(cli.coinbase_conf_timeout_secs),
            rng_seed: None,
        },
    )?);

    let node = Arc::new(
        NodeClient::connect(&cli.node_rpc)
            .await
            .context("unable to connect to node RPC")?,
    );
    let wallet = Arc::new(
        WalletClient::connect(&cli.wallet_rpc, cli.wallet_account)
            .await
            .context("unable to connect to wallet RPC")?,
    );
    mgr.set_tx_creator(Some(node.clone()));
    mgr.set_tx_broadcaster(Some(wallet));
    info!(network = chain.name, "payment daemon started");

    let cancel = CancellationToken::new();
    let mut ticks = tokio::time::interval(Duration::from_secs(cli.dividend_interval_secs));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutting down");
                cancel.cancel();
                break;
            }
            _ = ticks.tick() => {
                if let Err(err) = run_dividend_tick(&mgr, &node, &cancel).await {
                    error!(?err, "dividend tick failed");
                }
            }
        }
    }

    Ok(())
}

async fn run_dividend_tick(
    mgr: &PaymentMgr,
    node: &NodeClient,
    cancel: &CancellationToken,
) -> Result<()> {
    let height = node.best_block_height().await?;
    let treasury_active = match node.treasury_active().await {
        Ok(active) => active,
        Err(err) => {
            warn!(?err, "unable to query treasury status, assuming active");
            true
        }
    };
    mgr.pay_dividends(cancel, height, treasury_active).await?;
    Ok(())
}
