use std::fmt;
use std::time::Duration;

/// Upstream data providers the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Alchemy,
    Etherscan,
    CoinGecko,
    DefiLlama,
    Rpc,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alchemy => "alchemy",
            Self::Etherscan => "etherscan",
            Self::CoinGecko => "coingecko",
            Self::DefiLlama => "defillama",
            Self::Rpc => "rpc",
        }
    }

    /// Back-off used when a 429 carries no `Retry-After` header.
    pub fn default_retry_after(&self) -> Duration {
        match self {
            Self::Alchemy | Self::DefiLlama => Duration::from_secs(60),
            Self::CoinGecko => Duration::from_secs(5 * 60),
            Self::Etherscan => Duration::from_secs(5),
            Self::Rpc => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alchemy" => Ok(Self::Alchemy),
            "etherscan" => Ok(Self::Etherscan),
            "coingecko" => Ok(Self::CoinGecko),
            "defillama" => Ok(Self::DefiLlama),
            "rpc" => Ok(Self::Rpc),
            other => Err(Error::Configuration(format!("unknown provider: {other}"))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rate limited by {provider}; retry after {retry_after:?}")]
    RateLimited {
        provider: Provider,
        retry_after: Duration,
    },

    #[error("{provider} fetch failed: {message}")]
    TransientFetch { provider: Provider, message: String },

    #[error("{provider} rejected block range: {message}")]
    RangeTooLarge { provider: Provider, message: String },

    #[error("fatal provider configuration: {0}")]
    FatalConfig(String),

    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("analysis failed: {0}")]
    FatalAnalysis(String),

    #[error("database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transient(provider: Provider, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            provider,
            message: message.into(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_range_too_large(&self) -> bool {
        matches!(self, Self::RangeTooLarge { .. })
    }

    /// Short label for metrics and checkpoint notes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransientFetch { .. } => "transient_fetch",
            Self::RangeTooLarge { .. } => "range_too_large",
            Self::FatalConfig(_) => "fatal_config",
            Self::PersistenceConflict(_) => "persistence_conflict",
            Self::FatalAnalysis(_) => "fatal_analysis",
            Self::Database(_) => "database",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(err)
    }
}
