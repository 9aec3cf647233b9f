use std::collections::HashSet;

use common::db::AsyncDb;
use common::error::{Error, Result};
use common::providers::{token_metadata_cached, MetadataCache, PriceSource, TokenMetadataSource};
use common::types::{normalize_address, scale_amount, ActivityEvent};
use serde::Serialize;

/// Stablecoin classifier: a static address allow-list plus a symbol heuristic.
#[derive(Debug, Clone, Default)]
pub struct StableSet {
    addresses: HashSet<String>,
}

impl StableSet {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            addresses: addresses.into_iter().map(|a| normalize_address(a.as_ref())).collect(),
        }
    }

    pub fn is_listed(&self, token: &str) -> bool {
        self.addresses.contains(&normalize_address(token))
    }

    pub fn is_stable(&self, token: &str, symbol: Option<&str>) -> bool {
        self.is_listed(token) || symbol.is_some_and(is_stable_symbol)
    }
}

pub fn is_stable_symbol(symbol: &str) -> bool {
    let s = symbol.trim().to_ascii_uppercase();
    s.ends_with("USD") || s == "USDT" || s == "USDC"
}

/// USD unit price of `token` at `unix`: 1.0 for stables (listed or matched by
/// `symbol`), else the price source. Non-positive quotes are treated as missing.
pub async fn unit_price<P>(
    prices: &P,
    stables: &StableSet,
    token: &str,
    symbol: Option<&str>,
    unix: i64,
) -> Result<Option<f64>>
where
    P: PriceSource + Sync,
{
    if stables.is_stable(token, symbol) {
        return Ok(Some(1.0));
    }
    Ok(prices.price_at(&normalize_address(token), unix).await?.filter(|p| *p > 0.0))
}

/// [`unit_price`], with every failure except a rate limit degraded to a
/// missing price.
pub async fn price_or_missing<P>(
    prices: &P,
    stables: &StableSet,
    token: &str,
    symbol: Option<&str>,
    unix: i64,
) -> Result<Option<f64>>
where
    P: PriceSource + Sync,
{
    match unit_price(prices, stables, token, symbol, unix).await {
        Ok(p) => Ok(p),
        Err(e @ Error::RateLimited { .. }) => Err(e),
        Err(e) => {
            tracing::warn!(token, unix, error = %e, "price lookup failed");
            Ok(None)
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrichSummary {
    pub priced: u64,
    pub missing: u64,
    pub filtered: u64,
}

/// USD legs for one swap. `None` when neither leg could be priced.
async fn price_event<P, M>(
    event: &ActivityEvent,
    prices: &P,
    meta: &M,
    meta_cache: &MetadataCache,
    stables: &StableSet,
) -> Result<(Option<f64>, Option<f64>, Option<f64>)>
where
    P: PriceSource + Sync,
    M: TokenMetadataSource + Sync,
{
    let unix = event.timestamp.timestamp();
    let mut legs = [None, None];
    for (slot, (token, raw)) in legs
        .iter_mut()
        .zip([(&event.asset_in, event.amount_in_raw), (&event.asset_out, event.amount_out_raw)])
    {
        if raw == 0 {
            continue;
        }
        let metadata = token_metadata_cached(meta, meta_cache, token).await?.unwrap_or_default();
        let symbol = Some(metadata.symbol.as_str()).filter(|s| !s.is_empty());
        let amount = scale_amount(raw, metadata.decimals);
        if let Some(price) = price_or_missing(prices, stables, token, symbol, unix).await? {
            *slot = Some(amount * price);
        }
    }
    let [usd_in, usd_out] = legs;
    let notional = usd_in.unwrap_or(0.0).max(usd_out.unwrap_or(0.0));
    Ok((usd_in, usd_out, (notional > 0.0).then_some(notional)))
}

/// Price every unenriched activity row.
///
/// Rows whose notional is below `usd_min` are deleted. Rows that cannot be
/// priced at all are marked enriched with no USD values so they are not
/// retried every pass.
pub async fn enrich_activity<P, M>(
    db: &AsyncDb,
    chain_id: i64,
    prices: &P,
    meta: &M,
    meta_cache: &MetadataCache,
    stables: &StableSet,
    usd_min: f64,
) -> Result<EnrichSummary>
where
    P: PriceSource + Sync,
    M: TokenMetadataSource + Sync,
{
    const PAGE: usize = 500;
    let mut summary = EnrichSummary::default();

    loop {
        let page = db.unenriched_activity_on_chain(chain_id, PAGE).await?;
        if page.is_empty() {
            break;
        }
        let mut to_delete = Vec::new();
        for (id, event) in &page {
            let (usd_in, usd_out, notional) = price_event(event, prices, meta, meta_cache, stables).await?;
            match notional {
                None => {
                    summary.missing += 1;
                    db.update_activity_usd(*id, None, None, None).await?;
                }
                Some(n) if n < usd_min => {
                    summary.filtered += 1;
                    to_delete.push(*id);
                }
                Some(n) => {
                    summary.priced += 1;
                    db.update_activity_usd(*id, usd_in, usd_out, Some(n)).await?;
                }
            }
        }
        db.delete_activity(to_delete).await?;
        if page.len() < PAGE {
            break;
        }
    }

    tracing::info!(
        chain_id,
        priced = summary.priced,
        missing = summary.missing,
        filtered = summary.filtered,
        "activity enrichment finished"
    );
    Ok(summary)
}
