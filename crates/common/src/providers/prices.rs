use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use serde::Deserialize;

use super::cache::PriceCache;
use super::http;
use super::PriceSource;
use crate::error::{Error, Provider, Result};
use crate::types::normalize_address;

/// Half-width of the CoinGecko range query around the requested instant.
const RANGE_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Deserialize)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct LlamaResponse {
    #[serde(default)]
    coins: HashMap<String, LlamaCoin>,
}

#[derive(Debug, Deserialize)]
struct LlamaCoin {
    price: f64,
}

pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    platform: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(Error::FatalConfig("coingecko url is not configured".to_string()));
        }
        Ok(Self {
            http: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: Some(api_key.to_string()).filter(|k| !k.is_empty()),
            platform: "ethereum".to_string(),
        })
    }

    /// Asset platform id used in contract lookups, e.g. `arbitrum-one`.
    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn range_url(&self, token: &str, unix: i64) -> String {
        format!(
            "{}/coins/{}/contract/{}/market_chart/range?vs_currency=usd&from={}&to={}",
            self.base_url,
            self.platform,
            normalize_address(token),
            unix - RANGE_WINDOW_SECS,
            unix + RANGE_WINDOW_SECS
        )
    }

    async fn fetch(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        let mut req = self.http.get(self.range_url(token, unix));
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| http::transport_error(Provider::CoinGecko, &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = http::check_status(Provider::CoinGecko, resp).await?;
        let chart: MarketChart = resp
            .json()
            .await
            .map_err(|e| Error::transient(Provider::CoinGecko, format!("bad market chart: {e}")))?;
        Ok(closest_price(&chart.prices, unix))
    }
}

/// Price from the point nearest to `unix`. Points are `[millis, price]`.
#[allow(clippy::cast_precision_loss)]
fn closest_price(points: &[(f64, f64)], unix: i64) -> Option<f64> {
    let target_ms = unix as f64 * 1000.0;
    points
        .iter()
        .min_by(|a, b| (a.0 - target_ms).abs().total_cmp(&(b.0 - target_ms).abs()))
        .map(|p| p.1)
        .filter(|p| *p > 0.0)
}

impl PriceSource for CoinGeckoClient {
    async fn price_at(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        http::instrumented("coingecko_market_chart_range", self.fetch(token, unix)).await
    }
}

pub struct DefiLlamaClient {
    http: reqwest::Client,
    base_url: String,
    chain: String,
}

impl DefiLlamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = if base_url.trim().is_empty() {
            "https://coins.llama.fi"
        } else {
            base_url.trim_end_matches('/')
        };
        Ok(Self {
            http: http::build_client(timeout)?,
            base_url: base_url.to_string(),
            chain: "ethereum".to_string(),
        })
    }

    pub fn with_chain(mut self, chain: &str) -> Self {
        self.chain = chain.to_string();
        self
    }

    fn coin_key(&self, token: &str) -> String {
        format!("{}:{}", self.chain, normalize_address(token))
    }

    pub fn historical_url(&self, token: &str, unix: i64) -> String {
        format!("{}/prices/historical/{unix}/{}", self.base_url, self.coin_key(token))
    }

    async fn fetch(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        let resp = self
            .http
            .get(self.historical_url(token, unix))
            .send()
            .await
            .map_err(|e| http::transport_error(Provider::DefiLlama, &e))?;
        let resp = http::check_status(Provider::DefiLlama, resp).await?;
        let body: LlamaResponse = resp
            .json()
            .await
            .map_err(|e| Error::transient(Provider::DefiLlama, format!("bad response: {e}")))?;
        let key = self.coin_key(token);
        Ok(body
            .coins
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, c)| c.price)
            .filter(|p| *p > 0.0))
    }
}

impl PriceSource for DefiLlamaClient {
    async fn price_at(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        http::instrumented("defillama_prices_historical", self.fetch(token, unix)).await
    }
}

/// Tries `primary`, then `secondary` when the primary fails or has no price.
pub struct FallbackPrices<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackPrices<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P, S> PriceSource for FallbackPrices<P, S>
where
    P: PriceSource + Sync,
    S: PriceSource + Sync,
{
    async fn price_at(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        let primary_err = match self.primary.price_at(token, unix).await {
            Ok(Some(p)) if p > 0.0 => return Ok(Some(p)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(token, unix, error = %e, "primary price source failed; trying fallback");
                Some(e)
            }
        };
        match self.secondary.price_at(token, unix).await {
            Ok(Some(p)) if p > 0.0 => Ok(Some(p)),
            Ok(_) => Ok(None),
            // Keep the primary's rate limit visible when both sources fail.
            Err(e) => match primary_err {
                Some(pe @ Error::RateLimited { .. }) => Err(pe),
                _ => Err(e),
            },
        }
    }
}

/// Memoizes resolved prices per token and minute.
pub struct CachedPrices<P> {
    inner: P,
    cache: PriceCache,
}

impl<P> CachedPrices<P> {
    pub fn new(inner: P, cache: PriceCache) -> Self {
        Self { inner, cache }
    }
}

pub fn price_cache_key(token: &str, unix: i64) -> String {
    let minute = DateTime::from_timestamp(unix, 0)
        .map(|t| t.format("%Y-%m-%d-%H:%M").to_string())
        .unwrap_or_else(|| unix.to_string());
    format!("{}|{minute}", normalize_address(token))
}

impl<P> PriceSource for CachedPrices<P>
where
    P: PriceSource + Sync,
{
    async fn price_at(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        let key = price_cache_key(token, unix);
        if let Some(p) = self.cache.get(&key) {
            return Ok(Some(p));
        }
        let price = self.inner.price_at(token, unix).await?;
        if let Some(p) = price {
            self.cache.insert(key, p);
        }
        Ok(price)
    }
}
