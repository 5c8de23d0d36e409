use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use csv::Reader;
use dotenv::dotenv;
use ethers::{
    contract::abigen,
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, TxHash, U256, U64},
    utils::{format_units, parse_units, ParseUnits},
};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use rand::{seq::SliceRandom, Rng};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::time::{sleep, timeout};

abigen!(
    Erc20,
    r#"[
        function name() external view returns (string)
        function transfer(address to, uint256 amount) external returns (bool)
    ]"#
);

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distribute ERC-20 tokens to recipients
    Distribute(DistributeArgs),
    /// Generate test recipients
    GenerateRecipients(GenerateArgs),
}

#[derive(Parser)]
struct DistributeArgs {
    /// Sender wallets JSON file
    #[clap(long, default_value = "wallets.json")]
    wallets: PathBuf,

    /// Input CSV file with recipients
    #[clap(long, default_value = "recipients.csv")]
    recipients: PathBuf,

    /// HTTP RPC endpoint (falls back to the TEA_RPC_URL env var)
    #[clap(long)]
    rpc: Option<String>,

    /// Token decimal precision for this run
    #[clap(long, default_value = "18")]
    decimals: u32,

    /// Minimum delay between transfers, in milliseconds
    #[clap(long, default_value = "1000")]
    delay_min_ms: u64,

    /// Maximum delay between transfers, in milliseconds
    #[clap(long, default_value = "3000")]
    delay_max_ms: u64,

    /// Give up waiting for a confirmation after this many seconds
    #[clap(long, default_value = "180")]
    confirm_timeout_secs: u64,

    /// Block explorer base URL for transaction links
    #[clap(long)]
    explorer: Option<String>,

    /// Perform a dry run
    #[clap(long)]
    dry_run: bool,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,
}

#[derive(Parser)]
struct GenerateArgs {
    /// Number of recipients
    #[clap(long)]
    count: usize,

    /// Amount per recipient (in human units)
    #[clap(long)]
    amount: String,

    /// Output CSV file
    #[clap(long)]
    output: PathBuf,
}

#[derive(Debug, Error)]
enum DropError {
    #[error("cannot pick from an empty pool")]
    EmptyPool,
    #[error("transaction {tx:?} unconfirmed after {after:?}")]
    ConfirmationTimeout { tx: TxHash, after: Duration },
}

/// One sender credential: the wallet that signs and the token contract it
/// distributes from.
#[derive(Debug, Clone)]
struct SenderAccount {
    address: Address,
    wallet: LocalWallet,
    token: Address,
}

#[derive(Debug, Clone)]
struct Recipient {
    address: Address,
    /// Human-unit decimal amount, converted to base units at transfer time.
    amount: String,
}

#[derive(Debug)]
struct TransferOutcome {
    recipient: Address,
    amount: String,
    token_name: Option<String>,
    tx_hash: Option<TxHash>,
    succeeded: bool,
    error: Option<String>,
}

impl TransferOutcome {
    fn success(recipient: &Recipient, token_name: Option<String>, tx_hash: TxHash) -> Self {
        Self {
            recipient: recipient.address,
            amount: recipient.amount.clone(),
            token_name,
            tx_hash: Some(tx_hash),
            succeeded: true,
            error: None,
        }
    }

    fn failure(recipient: &Recipient, token_name: Option<String>, error: anyhow::Error) -> Self {
        Self {
            recipient: recipient.address,
            amount: recipient.amount.clone(),
            token_name,
            tx_hash: None,
            succeeded: false,
            error: Some(format!("{error:#}")),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    attempted: usize,
    succeeded: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Distribute(args) => distribute(args).await,
        Commands::GenerateRecipients(args) => generate_recipients(args),
    }
}

async fn distribute(args: DistributeArgs) -> Result<()> {
    println!("\n🚀 Starting ERC-20 token distribution...");

    let rpc_url = args
        .rpc
        .clone()
        .or_else(|| std::env::var("TEA_RPC_URL").ok())
        .context("no RPC endpoint configured; pass --rpc or set TEA_RPC_URL")?;

    let senders = load_senders(&args.wallets)?;
    let recipients = load_recipients(&args.recipients)?;

    println!("Sender wallets: {}", senders.len());
    println!("Recipients: {}", recipients.len());
    println!("Token decimals: {}", args.decimals);

    // Both pools must be non-empty before any selection happens.
    if senders.is_empty() || recipients.is_empty() {
        return Err(DropError::EmptyPool.into());
    }

    let pacer = Pacer::new(args.delay_min_ms, args.delay_max_ms)?;

    if args.dry_run {
        return dry_run_summary(&senders, &recipients, args.decimals);
    }

    // Confirm before proceeding (unless --yes flag)
    if !args.yes {
        println!("\nReady to distribute? [y/N] ");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    } else {
        println!("\nProceeding with distribution (--yes flag set)");
    }

    let provider = Provider::<Http>::try_from(rpc_url.as_str())
        .with_context(|| format!("invalid RPC endpoint {rpc_url}"))?;
    let chain_id = provider
        .get_chainid()
        .await
        .context("failed to query chain id from the RPC endpoint")?
        .as_u64();
    println!("Connected to chain id {chain_id}");

    let service = EthTokenService {
        provider,
        chain_id,
        confirm_timeout: Duration::from_secs(args.confirm_timeout_secs),
    };
    let executor = TransferExecutor::new(service, args.decimals);

    let summary = run_distribution(
        &senders,
        &recipients,
        &executor,
        &pacer,
        args.explorer.as_deref(),
    )
    .await?;

    println!("\n✅ Distribution complete!");
    println!("Attempted: {}", summary.attempted);
    println!("Succeeded: {}", summary.succeeded);
    println!("Failed: {}", summary.failed);

    Ok(())
}

fn generate_recipients(args: GenerateArgs) -> Result<()> {
    println!(
        "Generating {} recipients with {} tokens each...",
        args.count, args.amount
    );

    let mut writer = csv::Writer::from_path(&args.output)?;
    writer.write_record(["wallet", "amount"])?;

    let mut rng = ethers::core::rand::thread_rng();
    for _ in 0..args.count {
        let wallet = LocalWallet::new(&mut rng);
        writer.write_record([format!("{:?}", wallet.address()), args.amount.clone()])?;
    }

    writer.flush()?;
    println!(
        "Generated {} recipients in {}",
        args.count,
        args.output.display()
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SenderRecord {
    address: String,
    private_key: String,
    token_address: String,
}

fn load_senders(path: &Path) -> Result<Vec<SenderAccount>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read sender wallets from {}", path.display()))?;
    let records: Vec<SenderRecord> = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse sender wallets JSON from {}", path.display()))?;

    let mut senders = Vec::with_capacity(records.len());
    for record in records {
        let address: Address = record
            .address
            .parse()
            .with_context(|| format!("invalid sender address {:?}", record.address))?;
        let wallet: LocalWallet = record
            .private_key
            .parse()
            .with_context(|| format!("invalid private key for sender {:?}", record.address))?;
        let token: Address = record
            .token_address
            .parse()
            .with_context(|| format!("invalid token address {:?}", record.token_address))?;

        if wallet.address() != address {
            warn!(
                "sender {:?} does not match the address derived from its key ({:?})",
                address,
                wallet.address()
            );
        }

        senders.push(SenderAccount {
            address,
            wallet,
            token,
        });
    }

    Ok(senders)
}

#[derive(Debug, Deserialize)]
struct RecipientRecord {
    wallet: String,
    amount: String,
}

fn load_recipients(path: &Path) -> Result<Vec<Recipient>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("failed to open recipient CSV {}", path.display()))?;
    let mut recipients = Vec::new();

    for result in reader.deserialize() {
        let record: RecipientRecord =
            result.with_context(|| format!("malformed row in {}", path.display()))?;
        let address: Address = record
            .wallet
            .parse()
            .with_context(|| format!("invalid recipient address {:?}", record.wallet))?;

        recipients.push(Recipient {
            address,
            amount: record.amount.trim().to_string(),
        });
    }

    Ok(recipients)
}

/// Uniform random selection over a pool. Selection is independent across
/// calls; the same element may be picked repeatedly.
fn pick_random<T>(pool: &[T]) -> Result<&T, DropError> {
    pool.choose(&mut rand::thread_rng())
        .ok_or(DropError::EmptyPool)
}

fn to_base_units(amount: &str, decimals: u32) -> Result<U256> {
    let parsed = parse_units(amount.trim(), decimals)
        .with_context(|| format!("invalid token amount {amount:?}"))?;
    match parsed {
        ParseUnits::U256(value) => Ok(value),
        // A signed parse result would wrap to a near-max U256.
        ParseUnits::I256(_) => anyhow::bail!("negative token amount {amount:?}"),
    }
}

/// Read and transfer operations against the token contract. Kept behind a
/// trait so the scheduling logic runs against a mock network in tests.
#[async_trait]
trait TokenService {
    async fn token_name(&self, token: Address) -> Result<String>;

    /// Submits the transfer and waits for one confirmation. Not idempotent:
    /// a retry resubmits a new transaction.
    async fn transfer(&self, sender: &SenderAccount, to: Address, amount: U256) -> Result<TxHash>;
}

struct EthTokenService {
    provider: Provider<Http>,
    chain_id: u64,
    confirm_timeout: Duration,
}

#[async_trait]
impl TokenService for EthTokenService {
    async fn token_name(&self, token: Address) -> Result<String> {
        let contract = Erc20::new(token, Arc::new(self.provider.clone()));
        let name = contract
            .name()
            .call()
            .await
            .with_context(|| format!("failed to read name() from token {token:?}"))?;
        Ok(name)
    }

    async fn transfer(&self, sender: &SenderAccount, to: Address, amount: U256) -> Result<TxHash> {
        let wallet = sender.wallet.clone().with_chain_id(self.chain_id);
        let client = Arc::new(SignerMiddleware::new(self.provider.clone(), wallet));
        let contract = Erc20::new(sender.token, client);

        let call = contract.transfer(to, amount);
        let pending = call
            .send()
            .await
            .with_context(|| format!("failed to submit transfer to {to:?}"))?;
        let tx_hash = pending.tx_hash();

        let receipt = timeout(self.confirm_timeout, pending.confirmations(1))
            .await
            .map_err(|_| DropError::ConfirmationTimeout {
                tx: tx_hash,
                after: self.confirm_timeout,
            })?
            .with_context(|| format!("confirmation wait failed for {tx_hash:?}"))?
            .ok_or_else(|| {
                anyhow::anyhow!("transaction {tx_hash:?} was dropped from the mempool")
            })?;

        if receipt.status != Some(U64::one()) {
            anyhow::bail!("transaction {tx_hash:?} reverted on-chain");
        }

        Ok(tx_hash)
    }
}

struct TransferExecutor<S> {
    service: S,
    decimals: u32,
}

impl<S: TokenService> TransferExecutor<S> {
    fn new(service: S, decimals: u32) -> Self {
        Self { service, decimals }
    }

    /// Runs one transfer end to end. Every error is captured into the
    /// outcome; this never propagates, so a failed transfer cannot abort
    /// the batch.
    async fn execute(&self, sender: &SenderAccount, recipient: &Recipient) -> TransferOutcome {
        // Display metadata only; a token without a readable name still
        // gets transferred.
        let token_name = match self.service.token_name(sender.token).await {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("failed to resolve token name for {:?}: {e:#}", sender.token);
                None
            }
        };

        let amount = match to_base_units(&recipient.amount, self.decimals) {
            Ok(amount) => amount,
            Err(e) => return TransferOutcome::failure(recipient, token_name, e),
        };

        match self.service.transfer(sender, recipient.address, amount).await {
            Ok(tx_hash) => TransferOutcome::success(recipient, token_name, tx_hash),
            Err(e) => TransferOutcome::failure(recipient, token_name, e),
        }
    }
}

/// Randomized delay between transfers, drawn uniformly from an inclusive
/// millisecond range. Keeps the request pattern from looking bursty to the
/// remote endpoint.
struct Pacer {
    min_ms: u64,
    max_ms: u64,
}

impl Pacer {
    fn new(min_ms: u64, max_ms: u64) -> Result<Self> {
        if min_ms > max_ms {
            anyhow::bail!("delay bound is inverted: min {min_ms}ms > max {max_ms}ms");
        }
        Ok(Self { min_ms, max_ms })
    }

    fn sample_ms(&self) -> u64 {
        rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
    }

    async fn wait(&self) {
        sleep(Duration::from_millis(self.sample_ms())).await;
    }
}

/// Top-level driver: one round per recipient, strictly sequential. Sender
/// and recipient are re-sampled independently each round, so the loop does
/// not guarantee every recipient in the ledger is visited.
async fn run_distribution<S: TokenService>(
    senders: &[SenderAccount],
    recipients: &[Recipient],
    executor: &TransferExecutor<S>,
    pacer: &Pacer,
    explorer: Option<&str>,
) -> Result<RunSummary> {
    if senders.is_empty() || recipients.is_empty() {
        return Err(DropError::EmptyPool.into());
    }

    let rounds = recipients.len();
    let pb = ProgressBar::new(rounds as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} Transferring")?
            .progress_chars("##-"),
    );

    let mut summary = RunSummary::default();

    for round in 0..rounds {
        let sender = pick_random(senders)?;
        let recipient = pick_random(recipients)?;

        let outcome = executor.execute(sender, recipient).await;
        summary.attempted += 1;

        if outcome.succeeded {
            summary.succeeded += 1;
            let token = outcome.token_name.as_deref().unwrap_or("tokens");
            if let Some(tx_hash) = outcome.tx_hash {
                pb.println(format!(
                    "➡️  Sent {} {} from {:?} to {:?}. Tx: {:?}",
                    outcome.amount, token, sender.address, outcome.recipient, tx_hash
                ));
                if let Some(base) = explorer {
                    pb.println(format!(
                        "✅ Explorer: {}/tx/{:?}",
                        base.trim_end_matches('/'),
                        tx_hash
                    ));
                }
            }
        } else {
            summary.failed += 1;
            pb.println(format!(
                "❌ Failed to send to {:?}: {}",
                outcome.recipient,
                outcome.error.as_deref().unwrap_or("unknown error")
            ));
        }
        pb.inc(1);

        // No delay after the final round.
        if round + 1 < rounds {
            pacer.wait().await;
        }
    }

    pb.finish_with_message("Distribution complete");
    Ok(summary)
}

fn dry_run_summary(
    senders: &[SenderAccount],
    recipients: &[Recipient],
    decimals: u32,
) -> Result<()> {
    println!("\n=== DRY RUN SUMMARY ===");
    println!("Sender wallets: {}", senders.len());
    println!("Recipients: {}", recipients.len());
    println!("Transfer rounds: {}", recipients.len());

    let mut total = U256::zero();
    for recipient in recipients {
        let amount = to_base_units(&recipient.amount, decimals)
            .with_context(|| format!("recipient {:?}", recipient.address))?;
        total += amount;
    }

    println!(
        "Total tokens requested: {} ({} base units)",
        format_units(total, decimals)?,
        total
    );
    Ok(())
}
