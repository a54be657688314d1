//! Passport One runs passport anchoring as a single binary: an HTTP daemon plus one-shot
//! commands against the same chain and store.
#![warn(missing_docs)]

mod commands;
mod daemon;
mod http;
mod http_metrics;
mod metrics;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use passport_anchor_evm::{
    ConfirmationConfig, EndpointConfig, EvmAnchorChain, EvmConfig, FeeConfig, Network, GWEI,
};
use passport_anchor_service::{AnchorService, ServiceConfig, SqliteAnchoringStore, SqliteJobStore};
use passport_metrics::{config::Config as MetricsConfig, MetricsHandle};
use passport_sql::sqlite::{SqliteOpts, SqlitePool};
use signal_hook_tokio::Signals;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    log_opts: LogOpts,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and confirm pending anchors periodically
    Daemon(daemon::DaemonOpts),
    /// Anchor a record
    Submit(commands::SubmitOpts),
    /// Check one batch of pending anchor jobs and print the results
    Confirm(commands::ConfirmOpts),
    /// Check whether the current digest of a record is anchored
    Verify(commands::VerifyOpts),
    /// Print the most recent anchor event of a record
    Latest(commands::LatestOpts),
    /// Print the mining state of a transaction
    Status(commands::StatusOpts),
    /// Print the digests and passport id of a record without touching the chain
    Digest(commands::DigestOpts),
}

/// Everything needed to reach the chain and the store.
#[derive(Args, Debug)]
struct AnchorOpts {
    #[command(flatten)]
    chain: ChainOpts,

    #[command(flatten)]
    endpoints: EndpointOpts,

    #[command(flatten)]
    fees: FeeOpts,

    #[command(flatten)]
    confirmation: ConfirmationOpts,

    #[command(flatten)]
    db_opts: DBOpts,
}

#[derive(Args)]
struct ChainOpts {
    /// Network the anchor contract is deployed on.
    #[arg(long, default_value = "amoy", env = "PASSPORT_ONE_NETWORK")]
    network: NetworkArg,

    /// RPC endpoints tried before any vendor or public endpoint.
    #[arg(
        long,
        use_value_delimiter = true,
        value_delimiter = ',',
        env = "PASSPORT_ONE_RPC_URLS"
    )]
    rpc_urls: Vec<String>,

    /// Alchemy API key. Adds the Alchemy endpoint of the network to the pool.
    #[arg(long, env = "PASSPORT_ONE_ALCHEMY_KEY", hide_env_values = true)]
    alchemy_key: Option<String>,

    /// Infura API key. Adds the Infura endpoint of the network to the pool.
    #[arg(long, env = "PASSPORT_ONE_INFURA_KEY", hide_env_values = true)]
    infura_key: Option<String>,

    /// Hex private key of the signing account. Required to submit anchors.
    #[arg(long, env = "PASSPORT_ONE_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Address of the anchor contract.
    #[arg(long, env = "PASSPORT_ONE_CONTRACT_ADDRESS")]
    contract_address: String,

    /// First block scanned when verifying anchors.
    #[arg(long, default_value_t = 0, env = "PASSPORT_ONE_START_BLOCK")]
    start_block: u64,

    /// Number of blocks requested per log query.
    #[arg(long, default_value_t = 10_000, env = "PASSPORT_ONE_LOG_CHUNK_SIZE")]
    log_chunk_size: u64,
}

// Keys never end up in logs.
impl std::fmt::Debug for ChainOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainOpts")
            .field("network", &self.network)
            .field("rpc_urls", &self.rpc_urls)
            .field("alchemy_key", &self.alchemy_key.as_ref().map(|_| "<redacted>"))
            .field("infura_key", &self.infura_key.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("contract_address", &self.contract_address)
            .field("start_block", &self.start_block)
            .field("log_chunk_size", &self.log_chunk_size)
            .finish()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum NetworkArg {
    /// Polygon Amoy testnet
    Amoy,
    /// Polygon mainnet
    Polygon,
}

impl From<NetworkArg> for Network {
    fn from(value: NetworkArg) -> Self {
        match value {
            NetworkArg::Amoy => Network::Amoy,
            NetworkArg::Polygon => Network::Polygon,
        }
    }
}

#[derive(Args, Debug)]
struct EndpointOpts {
    /// Time allowed for a liveness probe of one RPC endpoint.
    #[arg(long, default_value_t = 10_000, env = "PASSPORT_ONE_PROBE_TIMEOUT_MS")]
    probe_timeout_ms: u64,

    /// How long a validated endpoint is reused without probing again.
    #[arg(long, default_value_t = 30, env = "PASSPORT_ONE_ENDPOINT_CACHE_TTL_SECS")]
    endpoint_cache_ttl_secs: u64,

    /// How long an endpoint that failed a probe is skipped.
    #[arg(long, default_value_t = 60, env = "PASSPORT_ONE_ENDPOINT_COOLDOWN_SECS")]
    endpoint_cooldown_secs: u64,

    /// Interval of the background re-probe of the cached endpoint.
    #[arg(long, default_value_t = 30, env = "PASSPORT_ONE_REVALIDATE_INTERVAL_SECS")]
    revalidate_interval_secs: u64,

    /// Time allowed for a typed read before it is retried over raw JSON-RPC.
    #[arg(long, default_value_t = 10_000, env = "PASSPORT_ONE_FALLBACK_TIMEOUT_MS")]
    fallback_timeout_ms: u64,
}

#[derive(Args, Debug)]
struct FeeOpts {
    /// Minimum EIP-1559 priority fee.
    #[arg(long, default_value_t = 30, env = "PASSPORT_ONE_PRIORITY_FLOOR_GWEI")]
    priority_floor_gwei: u64,

    /// Minimum EIP-1559 max fee.
    #[arg(long, default_value_t = 60, env = "PASSPORT_ONE_MAX_FEE_FLOOR_GWEI")]
    max_fee_floor_gwei: u64,

    /// Minimum legacy gas price.
    #[arg(long, default_value_t = 60, env = "PASSPORT_ONE_LEGACY_FLOOR_GWEI")]
    legacy_floor_gwei: u64,

    /// Factor applied to every fee estimate of the node.
    #[arg(long, default_value_t = 2, env = "PASSPORT_ONE_FEE_MULTIPLIER")]
    fee_multiplier: u64,

    /// Gas limit of the anchor call.
    #[arg(long, default_value_t = 300_000, env = "PASSPORT_ONE_GAS_LIMIT")]
    gas_limit: u64,
}

#[derive(Args, Debug)]
struct ConfirmationOpts {
    /// Bound on the wait for one confirmation of a synchronous submission.
    #[arg(long, default_value_t = 300, env = "PASSPORT_ONE_CONFIRMATION_TIMEOUT_SECS")]
    confirmation_timeout_secs: u64,

    /// Interval between receipt polls once the primary wait gave up.
    #[arg(long, default_value_t = 10, env = "PASSPORT_ONE_RECEIPT_POLL_INTERVAL_SECS")]
    receipt_poll_interval_secs: u64,

    /// Number of receipt polls before a synchronous submission times out.
    #[arg(long, default_value_t = 30, env = "PASSPORT_ONE_RECEIPT_POLL_ATTEMPTS")]
    receipt_poll_attempts: u32,

    /// Pending jobs checked per confirmation batch.
    #[arg(long, default_value_t = 5, env = "PASSPORT_ONE_BATCH_SIZE")]
    batch_size: usize,

    /// Receipt checks of a pending job before it times out.
    #[arg(long, default_value_t = 60, env = "PASSPORT_ONE_MAX_ATTEMPTS")]
    max_attempts: u32,
}

#[derive(Args, Debug)]
struct DBOpts {
    /// Path to storage directory
    #[arg(short, long, default_value = ".", env = "PASSPORT_ONE_STORE_DIR")]
    store_dir: PathBuf,
}

#[derive(Args, Debug)]
struct LogOpts {
    /// Specify the format of log events.
    #[arg(
        long,
        global = true,
        default_value = "multi-line",
        env = "PASSPORT_ONE_LOG_FORMAT"
    )]
    log_format: LogFormat,
}

impl LogOpts {
    fn format(&self) -> passport_metrics::config::LogFormat {
        match self.log_format {
            LogFormat::SingleLine => passport_metrics::config::LogFormat::SingleLine,
            LogFormat::MultiLine => passport_metrics::config::LogFormat::MultiLine,
            LogFormat::Json => passport_metrics::config::LogFormat::Json,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Default)]
enum LogFormat {
    /// Format log events on multiple lines using ANSI colors.
    #[default]
    MultiLine,
    /// Format log events on a single line using ANSI colors.
    SingleLine,
    /// Format log events newline delimited JSON objects.
    /// No ANSI colors are used.
    Json,
}

impl AnchorOpts {
    fn evm_config(&self) -> EvmConfig {
        let ChainOpts {
            network,
            rpc_urls,
            alchemy_key,
            infura_key,
            private_key,
            contract_address,
            start_block,
            log_chunk_size,
        } = &self.chain;
        EvmConfig {
            network: (*network).into(),
            rpc_urls: rpc_urls.clone(),
            alchemy_key: alchemy_key.clone(),
            infura_key: infura_key.clone(),
            private_key: private_key.clone().unwrap_or_default(),
            contract_address: contract_address.clone(),
            start_block: *start_block,
            log_chunk_size: *log_chunk_size,
            endpoints: EndpointConfig {
                probe_timeout: Duration::from_millis(self.endpoints.probe_timeout_ms),
                cache_ttl: Duration::from_secs(self.endpoints.endpoint_cache_ttl_secs),
                cooldown: Duration::from_secs(self.endpoints.endpoint_cooldown_secs),
                revalidate_interval: Duration::from_secs(self.endpoints.revalidate_interval_secs),
                fallback_timeout: Duration::from_millis(self.endpoints.fallback_timeout_ms),
            },
            fees: FeeConfig {
                multiplier: self.fees.fee_multiplier.into(),
                priority_floor: u128::from(self.fees.priority_floor_gwei) * GWEI,
                max_fee_floor: u128::from(self.fees.max_fee_floor_gwei) * GWEI,
                legacy_floor: u128::from(self.fees.legacy_floor_gwei) * GWEI,
                gas_limit: self.fees.gas_limit,
                ..Default::default()
            },
            confirmation: ConfirmationConfig {
                timeout: Duration::from_secs(self.confirmation.confirmation_timeout_secs),
                poll_interval: Duration::from_secs(self.confirmation.receipt_poll_interval_secs),
                poll_attempts: self.confirmation.receipt_poll_attempts,
            },
        }
    }

    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            batch_size: self.confirmation.batch_size,
            max_attempts: self.confirmation.max_attempts,
        }
    }

    /// Build the anchor service over the configured chain and store. A read only chain never
    /// needs the private key.
    async fn service(&self, access: ChainAccess) -> Result<(AnchorService, Arc<EvmAnchorChain>)> {
        let evm_metrics = MetricsHandle::register(passport_anchor_evm::Metrics::register);
        let service_metrics = MetricsHandle::register(passport_anchor_service::Metrics::register);
        let config = self.evm_config();
        let chain = Arc::new(match access {
            ChainAccess::Submit => EvmAnchorChain::new(config, evm_metrics)?,
            ChainAccess::ReadOnly => EvmAnchorChain::read_only(config, evm_metrics)?,
        });
        let pool = self.db_opts.get_pool().await?;
        let service = AnchorService::new(
            chain.clone(),
            Arc::new(SqliteJobStore::new(pool.clone())),
            Arc::new(SqliteAnchoringStore::new(pool)),
            self.service_config(),
            service_metrics,
        );
        Ok((service, chain))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainAccess {
    Submit,
    ReadOnly,
}

impl DBOpts {
    /// This function will create the database directory if it does not exist.
    async fn get_pool(&self) -> Result<SqlitePool> {
        match tokio::fs::create_dir_all(&self.store_dir).await {
            Ok(_) => {}
            Err(err) => match err.kind() {
                std::io::ErrorKind::AlreadyExists => {}
                _ => {
                    error!(
                        dir = %self.store_dir.display(),
                        %err, "failed to create required directory"
                    );
                    anyhow::bail!(err);
                }
            },
        }
        let pool = SqlitePool::connect_dir(&self.store_dir, SqliteOpts::default()).await?;
        info!(dir = %self.store_dir.display(), "connected to sqlite db");
        Ok(pool)
    }
}

/// Run the passport one binary process
pub async fn run() -> Result<()> {
    let Cli { command, log_opts } = Cli::parse();
    match command {
        Command::Daemon(opts) => daemon::run(opts, log_opts).await,
        Command::Submit(opts) => commands::submit(opts, log_opts).await,
        Command::Confirm(opts) => commands::confirm(opts, log_opts).await,
        Command::Verify(opts) => commands::verify(opts, log_opts).await,
        Command::Latest(opts) => commands::latest(opts, log_opts).await,
        Command::Status(opts) => commands::status(opts, log_opts).await,
        Command::Digest(opts) => commands::digest(opts, log_opts).await,
    }
}

async fn handle_signals(mut signals: Signals, shutdown: broadcast::Sender<()>) {
    let mut shutdown = Some(shutdown);
    while let Some(signal) = signals.next().await {
        debug!(?signal, "signal received");
        if let Some(shutdown) = shutdown.take() {
            info!("sending shutdown message");
            if shutdown.send(()).is_err() {
                debug!("no tasks left to shut down");
            }
        }
    }
}

/// Static information about the current process.
#[derive(Debug, Clone)]
pub struct Info {
    /// Name of the service.
    pub service_name: String,
    /// Semantic version of the build.
    pub version: String,
    /// Description of git commit.
    pub build: String,
    /// Unique name generated for this invocation of the process.
    pub instance_id: String,
}

impl Info {
    fn new() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            build: git_version::git_version!(
                prefix = "git:",
                cargo_prefix = "cargo:",
                fallback = "unknown"
            )
            .to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: names::Generator::default()
                .next()
                .unwrap_or_else(|| "passport-one".to_string()),
        }
    }

    fn apply_to_metrics_config(&self, cfg: &mut MetricsConfig) {
        cfg.service_name.clone_from(&self.service_name);
        cfg.version.clone_from(&self.version);
        cfg.build.clone_from(&self.build);
        cfg.instance_id.clone_from(&self.instance_id);
    }
}
