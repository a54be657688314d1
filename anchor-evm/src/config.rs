use std::{fmt::Display, str::FromStr, time::Duration};

use passport_anchor_service::Error;

use crate::fees::FeeConfig;

/// Networks the anchor contract is deployed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Polygon Amoy testnet
    #[default]
    Amoy,
    /// Polygon proof-of-stake mainnet
    Polygon,
}

impl Network {
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Amoy => 80002,
            Network::Polygon => 137,
        }
    }

    /// Public RPC endpoints used when nothing else is configured.
    pub fn default_rpc_urls(&self) -> &'static [&'static str] {
        match self {
            Network::Amoy => &[
                "https://rpc-amoy.polygon.technology",
                "https://polygon-amoy-bor-rpc.publicnode.com",
                "https://polygon-amoy.drpc.org",
            ],
            Network::Polygon => &[
                "https://polygon-rpc.com",
                "https://polygon-bor-rpc.publicnode.com",
                "https://polygon.drpc.org",
            ],
        }
    }

    pub fn alchemy_url(&self, key: &str) -> String {
        match self {
            Network::Amoy => format!("https://polygon-amoy.g.alchemy.com/v2/{key}"),
            Network::Polygon => format!("https://polygon-mainnet.g.alchemy.com/v2/{key}"),
        }
    }

    pub fn infura_url(&self, key: &str) -> String {
        match self {
            Network::Amoy => format!("https://polygon-amoy.infura.io/v3/{key}"),
            Network::Polygon => format!("https://polygon-mainnet.infura.io/v3/{key}"),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Amoy => write!(f, "amoy"),
            Network::Polygon => write!(f, "polygon"),
        }
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amoy" => Ok(Self::Amoy),
            "polygon" => Ok(Self::Polygon),
            v => anyhow::bail!("unknown network: {}", v),
        }
    }
}

/// Endpoint health settings
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Time allowed for a liveness probe of one endpoint
    pub probe_timeout: Duration,
    /// How long a validated endpoint is reused without probing again
    pub cache_ttl: Duration,
    /// How long an endpoint that failed a probe is skipped
    pub cooldown: Duration,
    /// Interval of the background re-probe of the cached endpoint
    pub revalidate_interval: Duration,
    /// Time allowed for a high level read before the raw JSON-RPC fallback runs
    pub fallback_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            revalidate_interval: Duration::from_secs(30),
            fallback_timeout: Duration::from_secs(10),
        }
    }
}

/// How long a synchronous submission waits for its receipt
#[derive(Clone, Debug)]
pub struct ConfirmationConfig {
    /// Bound on the primary wait for one confirmation
    pub timeout: Duration,
    /// Interval between raw receipt polls once the primary wait gave up
    pub poll_interval: Duration,
    /// Number of raw receipt polls before the wait times out
    pub poll_attempts: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300), // 5 minutes
            poll_interval: Duration::from_secs(10),
            poll_attempts: 30,
        }
    }
}

/// Configuration of the EVM anchor chain
#[derive(Clone, Debug)]
pub struct EvmConfig {
    /// Network the contract is deployed on
    pub network: Network,
    /// Explicit RPC endpoints, highest priority first
    pub rpc_urls: Vec<String>,
    /// Alchemy API key for a vendor endpoint
    pub alchemy_key: Option<String>,
    /// Infura API key for a vendor endpoint
    pub infura_key: Option<String>,
    /// Private key for signing transactions (hex string, `0x` optional)
    pub private_key: String,
    /// Address of the anchor contract
    pub contract_address: String,
    /// First block scanned when verifying anchors
    pub start_block: u64,
    /// Number of blocks per `eth_getLogs` request
    pub log_chunk_size: u64,
    pub endpoints: EndpointConfig,
    pub fees: FeeConfig,
    pub confirmation: ConfirmationConfig,
}

impl Default for EvmConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            rpc_urls: Vec::new(),
            alchemy_key: None,
            infura_key: None,
            private_key: String::new(),
            contract_address: String::new(),
            start_block: 0,
            log_chunk_size: 10_000,
            endpoints: EndpointConfig::default(),
            fees: FeeConfig::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }
}

impl EvmConfig {
    /// Candidate endpoints in priority order: explicit urls, then vendor urls, then the network
    /// defaults. Duplicates keep their first position.
    pub fn endpoint_pool(&self) -> Vec<String> {
        let vendor = self
            .alchemy_key
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| self.network.alchemy_url(k))
            .chain(
                self.infura_key
                    .iter()
                    .filter(|k| !k.is_empty())
                    .map(|k| self.network.infura_url(k)),
            );
        let candidates = self
            .rpc_urls
            .iter()
            .map(|u| u.trim().to_owned())
            .filter(|u| !u.is_empty())
            .chain(vendor)
            .chain(
                self.network
                    .default_rpc_urls()
                    .iter()
                    .map(|u| u.to_string()),
            );

        let mut pool: Vec<String> = Vec::new();
        for url in candidates {
            let key = url.trim_end_matches('/');
            if !pool.iter().any(|u| u.trim_end_matches('/') == key) {
                pool.push(url);
            }
        }
        pool
    }

    /// Validate everything needed to read from the chain.
    pub fn validate_read_only(&self) -> Result<(), Error> {
        if self.contract_address.is_empty() {
            return Err(Error::Configuration(
                "Contract address cannot be empty".to_owned(),
            ));
        }
        self.contract_address
            .parse::<alloy::primitives::Address>()
            .map_err(|e| Error::Configuration(format!("Invalid contract address: {e}")))?;

        let pool = self.endpoint_pool();
        if pool.is_empty() {
            return Err(Error::Configuration("No RPC endpoints configured".to_owned()));
        }
        for url in &pool {
            url::Url::parse(url)
                .map_err(|e| Error::Configuration(format!("Invalid RPC url {url}: {e}")))?;
        }

        if self.log_chunk_size == 0 {
            return Err(Error::Configuration(
                "Log chunk size must be greater than 0".to_owned(),
            ));
        }
        if self.fees.gas_limit == 0 {
            return Err(Error::Configuration(
                "Gas limit must be greater than 0".to_owned(),
            ));
        }
        if self.fees.multiplier == 0 {
            return Err(Error::Configuration(
                "Fee multiplier must be greater than 0".to_owned(),
            ));
        }
        if self.confirmation.poll_attempts == 0 {
            return Err(Error::Configuration(
                "Receipt poll attempts must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Validate everything needed to submit anchors.
    pub fn validate(&self) -> Result<(), Error> {
        if self.private_key.is_empty() {
            return Err(Error::Configuration(
                "Private key cannot be empty".to_owned(),
            ));
        }
        self.validate_read_only()
    }
}
