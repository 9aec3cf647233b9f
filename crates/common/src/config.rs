use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub providers: Providers,
    #[serde(default)]
    pub analysis_window: AnalysisWindow,
    pub collector: Collector,
    pub valuation: Valuation,
    pub analysis: Analysis,
    pub checkpoint: Checkpoint,
    pub mining: Mining,
    #[serde(default)]
    pub scoring: Scoring,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
    pub chain: String,
    pub chain_id: i64,
    pub alchemy_url: String,
    #[serde(default)]
    pub alchemy_api_key: String,
    pub etherscan_url: String,
    #[serde(default)]
    pub etherscan_api_key: String,
    pub coingecko_url: String,
    #[serde(default)]
    pub coingecko_api_key: String,
    pub defillama_url: String,
    pub request_timeout_secs: u64,
    pub rpc_max_retries: u32,
    pub rpc_retry_base_ms: u64,
    /// Use the explorer's timestamp-to-block endpoint instead of binary search.
    pub use_explorer_block_lookup: bool,
    /// TTL for cached historical prices; `None` keeps them for the process lifetime.
    pub price_cache_ttl_secs: Option<u64>,
    #[serde(default = "default_price_chain")]
    pub coingecko_platform: String,
    #[serde(default = "default_price_chain")]
    pub defillama_chain: String,
    /// Further networks collected and enriched alongside the primary chain.
    #[serde(default)]
    pub extra_chains: Vec<ChainEndpoint>,
}

/// One network the collector can talk to. `rpc_url` is the base URL; the
/// shared Alchemy key is appended by [`Providers::chains`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChainEndpoint {
    pub name: String,
    pub chain_id: i64,
    pub rpc_url: String,
    #[serde(default = "default_price_chain")]
    pub coingecko_platform: String,
    #[serde(default = "default_price_chain")]
    pub defillama_chain: String,
}

fn default_price_chain() -> String {
    "ethereum".to_string()
}

fn keyed_endpoint(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    if key.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{key}")
    }
}

impl Providers {
    /// JSON-RPC endpoint with the API key appended, the way Alchemy expects it.
    pub fn rpc_endpoint(&self) -> String {
        keyed_endpoint(&self.alchemy_url, &self.alchemy_api_key)
    }

    pub fn primary_chain(&self) -> ChainEndpoint {
        ChainEndpoint {
            name: self.chain.clone(),
            chain_id: self.chain_id,
            rpc_url: self.rpc_endpoint(),
            coingecko_platform: self.coingecko_platform.clone(),
            defillama_chain: self.defillama_chain.clone(),
        }
    }

    /// Every configured chain, primary first, with keyed RPC endpoints.
    pub fn chains(&self) -> Vec<ChainEndpoint> {
        std::iter::once(self.primary_chain())
            .chain(self.extra_chains.iter().map(|c| ChainEndpoint {
                rpc_url: keyed_endpoint(&c.rpc_url, &self.alchemy_api_key),
                ..c.clone()
            }))
            .collect()
    }

    /// Look a chain up by name (case-insensitive) or decimal chain id.
    pub fn find_chain(&self, name_or_id: &str) -> Option<ChainEndpoint> {
        let id = name_or_id.parse::<i64>().ok();
        self.chains()
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name_or_id) || Some(c.chain_id) == id)
    }
}

/// Raw window settings. Timestamps stay as strings here so the resolver can
/// reject non-UTC offsets with a configuration error instead of a parse error.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start: Option<String>,
    pub end: Option<String>,
    pub reference: Option<String>,
    pub t0_offset_hours: Option<i64>,
    pub t1_offset_hours: Option<i64>,
    pub t0_block: Option<u64>,
    pub t1_block: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Collector {
    pub default_block_span: u64,
    #[serde(default)]
    pub max_block_span: HashMap<String, u64>,
}

impl Collector {
    pub fn span_for(&self, chain: &str) -> u64 {
        self.max_block_span
            .get(&chain.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_block_span)
            .max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Valuation {
    pub max_tokens: usize,
    pub stable_heavy_threshold: f64,
    pub funding_heavy_threshold: f64,
    pub weth_address: String,
    pub stablecoins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Analysis {
    pub batch_size: usize,
    pub max_rate_limit_attempts: u32,
    pub rate_limit_backoff_secs: u64,
    pub progress_log_every: u64,
    pub snapshot_every: u64,
    pub snapshot_path: String,
    pub snapshot_limit: usize,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Checkpoint {
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mining {
    pub min_usd_notional: f64,
    pub spider_state_path: String,
    pub spider_start_block: Option<u64>,
    pub spider_max_blocks_per_run: u64,
    pub spider_interval_secs: u64,
    pub spider_enabled: bool,
    pub excluded_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scoring {
    #[serde(default)]
    pub pnl_mode: Option<String>,
    #[serde(default)]
    pub weights: ScoringWeights,
}

/// Partial weight overrides; unset entries keep their defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub t1_pnl: Option<f64>,
    pub t7_pnl: Option<f64>,
    pub win_rate: Option<f64>,
    pub trade_ratio: Option<f64>,
    pub impact: Option<f64>,
    pub repeatability: Option<f64>,
    pub liquidity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("EVALUATOR_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse evaluator config")?;
        config.validate()?;
        Ok(config)
    }

    /// Credentials are normally supplied via the environment rather than the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ALCHEMY_API_KEY").filter(|v| !v.is_empty()) {
            self.providers.alchemy_api_key = v;
        }
        if let Some(v) = lookup("ETHERSCAN_API_KEY").filter(|v| !v.is_empty()) {
            self.providers.etherscan_api_key = v;
        }
        if let Some(v) = lookup("COINGECKO_API_KEY").filter(|v| !v.is_empty()) {
            self.providers.coingecko_api_key = v;
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.analysis.batch_size > 0, "analysis.batch_size must be > 0");
        anyhow::ensure!(
            self.analysis.max_rate_limit_attempts > 0,
            "analysis.max_rate_limit_attempts must be > 0"
        );
        anyhow::ensure!(
            self.collector.default_block_span > 0,
            "collector.default_block_span must be > 0"
        );
        anyhow::ensure!(self.valuation.max_tokens > 0, "valuation.max_tokens must be > 0");
        anyhow::ensure!(
            self.mining.min_usd_notional >= 0.0,
            "mining.min_usd_notional must be >= 0"
        );
        anyhow::ensure!(
            self.providers.request_timeout_secs > 0,
            "providers.request_timeout_secs must be > 0"
        );
        let mut names = std::collections::HashSet::new();
        let mut ids = std::collections::HashSet::new();
        for c in self.providers.chains() {
            anyhow::ensure!(
                names.insert(c.name.to_ascii_lowercase()),
                "providers: duplicate chain name {}",
                c.name
            );
            anyhow::ensure!(ids.insert(c.chain_id), "providers: duplicate chain id {}", c.chain_id);
        }
        if let Some(mode) = &self.scoring.pnl_mode {
            anyhow::ensure!(
                mode.eq_ignore_ascii_case("fifo") || mode.eq_ignore_ascii_case("lifo"),
                "scoring.pnl_mode must be fifo or lifo"
            );
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
