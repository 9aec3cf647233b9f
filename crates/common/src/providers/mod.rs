//! Typed access to chain data and prices.
//!
//! Each capability is a small trait so the analysis code can run against
//! in-memory fakes. Every implementation maps an upstream 429 to
//! [`Error::RateLimited`](crate::error::Error::RateLimited).

use std::future::Future;

use crate::error::{Error, Result};
use crate::types::{normalize_address, AssetTransfer, BlockDirection, LogFilter, RawLog, TokenMetadata, TxInfo};

pub mod cache;
pub mod explorer;
mod http;
pub mod prices;
pub mod rpc;

pub use cache::{BlockTimeCache, Cache, MetadataCache, PriceCache};
pub use http::RetryPolicy;

pub trait BlockSource {
    fn latest_block(&self) -> impl Future<Output = Result<u64>> + Send;
    /// Unix seconds of `block`.
    fn block_timestamp(&self, block: u64) -> impl Future<Output = Result<i64>> + Send;
}

/// Timestamp-to-block lookup offered by block explorers.
pub trait BlockExplorer {
    fn block_at_time(
        &self,
        unix: i64,
        closest: BlockDirection,
    ) -> impl Future<Output = Result<u64>> + Send;
}

pub trait BalanceSource {
    /// Wei held by `address` at `block`.
    fn eth_balance(&self, address: &str, block: u64) -> impl Future<Output = Result<u128>> + Send;
    /// Base units of `token` held by `address` at `block`.
    fn token_balance(
        &self,
        address: &str,
        token: &str,
        block: u64,
    ) -> impl Future<Output = Result<u128>> + Send;
    /// Token contracts the address currently holds a nonzero balance of.
    fn held_tokens(&self, address: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

pub trait TokenMetadataSource {
    fn token_metadata(&self, token: &str) -> impl Future<Output = Result<TokenMetadata>> + Send;
}

pub trait TransferSource {
    /// Inbound and outbound transfers touching `address`, undeduplicated.
    fn asset_transfers(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<AssetTransfer>>> + Send;
}

pub trait LogSource {
    fn logs_in_range(&self, filter: &LogFilter) -> impl Future<Output = Result<Vec<RawLog>>> + Send;
}

pub trait TransactionSource {
    fn transaction(&self, hash: &str) -> impl Future<Output = Result<TxInfo>> + Send;
    /// `(token0, token1)` of a Uniswap-style pool.
    fn pool_tokens(&self, pool: &str) -> impl Future<Output = Result<(String, String)>> + Send;
}

pub trait PriceSource {
    /// USD price of `token` at `unix`. `Ok(None)` when the source has no data.
    fn price_at(&self, token: &str, unix: i64) -> impl Future<Output = Result<Option<f64>>> + Send;
}

/// Token balance that degrades to zero on failure. Rate limits still propagate
/// so the caller can back off instead of recording a wrong value.
pub async fn token_balance_or_zero<B>(source: &B, address: &str, token: &str, block: u64) -> Result<u128>
where
    B: BalanceSource + Sync,
{
    match source.token_balance(address, token, block).await {
        Ok(v) => Ok(v),
        Err(e @ Error::RateLimited { .. }) => Err(e),
        Err(e) => {
            tracing::warn!(address, token, block, error = %e, "token balance unreadable; using 0");
            Ok(0)
        }
    }
}

/// Metadata lookup through `cache`, keyed by lowercase token address.
/// `Ok(None)` when the source failed; failures are not cached.
pub async fn token_metadata_cached<M>(
    source: &M,
    cache: &MetadataCache,
    token: &str,
) -> Result<Option<TokenMetadata>>
where
    M: TokenMetadataSource + Sync,
{
    let key = normalize_address(token);
    if let Some(hit) = cache.get(&key) {
        return Ok(Some(hit));
    }
    match source.token_metadata(&key).await {
        Ok(meta) => {
            cache.insert(key, meta.clone());
            Ok(Some(meta))
        }
        Err(e @ Error::RateLimited { .. }) => Err(e),
        Err(e) => {
            tracing::warn!(token = %key, error = %e, "token metadata unavailable");
            Ok(None)
        }
    }
}
