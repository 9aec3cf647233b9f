//! Realized PnL through per-asset lot queues.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::db::AsyncDb;
use common::error::{Error, Result};
use common::providers::{token_metadata_cached, MetadataCache, TokenMetadataSource};
use common::types::{normalize_address, scale_amount, ActivityEvent};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostBasisMethod {
    #[default]
    Fifo,
    Lifo,
}

impl FromStr for CostBasisMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            other => Err(Error::Configuration(format!("unknown pnl mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub remaining: Decimal,
    pub cost: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Acquire,
    Dispose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub chain_id: i64,
    pub asset: String,
    pub side: Side,
    pub units: Decimal,
    /// Cost for acquisitions, proceeds for disposals.
    pub usd: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PnlSummary {
    pub realized: Decimal,
    pub gross: Decimal,
    pub trades: u64,
    pub realized_tokens: u64,
}

/// `value * part / whole` for `0 < part <= whole`. Falls back to scaling by
/// the ratio when the product overflows, which happens for raw spam-token
/// unit counts.
fn prorate(value: Decimal, part: Decimal, whole: Decimal) -> Decimal {
    value
        .checked_mul(part)
        .and_then(|v| v.checked_div(whole))
        .unwrap_or_else(|| value * (part / whole))
}

/// Open lots per `(chain, asset)` for one wallet.
#[derive(Debug, Default)]
pub struct LotBook {
    method: CostBasisMethod,
    lots: HashMap<(i64, String), VecDeque<Lot>>,
}

impl LotBook {
    pub fn new(method: CostBasisMethod) -> Self {
        Self {
            method,
            lots: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn open_lots(&self, chain_id: i64, asset: &str) -> Option<&VecDeque<Lot>> {
        self.lots.get(&(chain_id, normalize_address(asset)))
    }

    pub fn acquire(&mut self, chain_id: i64, asset: &str, units: Decimal, cost: Decimal, timestamp: DateTime<Utc>) {
        if units <= Decimal::ZERO {
            return;
        }
        self.lots
            .entry((chain_id, normalize_address(asset)))
            .or_default()
            .push_back(Lot {
                remaining: units,
                cost,
                timestamp,
            });
    }

    /// Consume lots for a disposal. Returns the realized gain, or `None` when
    /// no open lot matched.
    pub fn dispose(&mut self, chain_id: i64, asset: &str, units: Decimal, proceeds: Decimal) -> Option<Decimal> {
        let queue = self.lots.get_mut(&(chain_id, normalize_address(asset)))?;
        if queue.is_empty() || units <= Decimal::ZERO {
            return None;
        }

        let mut unallocated = units;
        let mut realized = Decimal::ZERO;
        while unallocated > Decimal::ZERO {
            let lot = match self.method {
                CostBasisMethod::Fifo => queue.front_mut(),
                CostBasisMethod::Lifo => queue.back_mut(),
            };
            let Some(lot) = lot else { break };

            let portion = lot.remaining.min(unallocated);
            let cost_portion = prorate(lot.cost, portion, lot.remaining);
            let proceeds_portion = prorate(proceeds, portion, units);
            realized = realized.saturating_add(proceeds_portion - cost_portion);

            lot.remaining -= portion;
            lot.cost -= cost_portion;
            unallocated -= portion;

            if lot.remaining <= Decimal::ZERO {
                match self.method {
                    CostBasisMethod::Fifo => queue.pop_front(),
                    CostBasisMethod::Lifo => queue.pop_back(),
                };
            }
        }
        Some(realized)
    }
}

/// Replay events in order through a fresh book.
pub fn replay(events: &[LedgerEvent], method: CostBasisMethod) -> (PnlSummary, LotBook) {
    let mut book = LotBook::new(method);
    let mut summary = PnlSummary::default();

    for e in events {
        summary.trades += 1;
        summary.gross = summary.gross.saturating_add(e.usd);
        match e.side {
            Side::Acquire => book.acquire(e.chain_id, &e.asset, e.units, e.usd, e.timestamp),
            Side::Dispose => {
                if let Some(gain) = book.dispose(e.chain_id, &e.asset, e.units, e.usd) {
                    summary.realized = summary.realized.saturating_add(gain);
                    summary.realized_tokens += 1;
                }
            }
        }
    }
    (summary, book)
}

fn units(raw: u128, decimals: u32) -> Option<Decimal> {
    i128::try_from(raw)
        .ok()
        .and_then(|r| Decimal::try_from_i128_with_scale(r, decimals).ok())
        .or_else(|| Decimal::try_from(scale_amount(raw, decimals)).ok())
}

fn usd(value: Option<f64>) -> Option<Decimal> {
    value
        .filter(|v| *v > 0.0)
        .and_then(|v| Decimal::try_from(v).ok())
}

/// Map swaps to ledger events. The trader disposes `asset_in` for `usd_in`
/// and acquires `asset_out` for `usd_out`. Unpriced legs are skipped.
pub fn ledger_from_swaps<F>(swaps: &[ActivityEvent], decimals_of: F) -> Vec<LedgerEvent>
where
    F: Fn(i64, &str) -> u32,
{
    let mut out = Vec::with_capacity(swaps.len() * 2);
    for s in swaps {
        let legs = [
            (Side::Dispose, &s.asset_in, s.amount_in_raw, s.usd_in),
            (Side::Acquire, &s.asset_out, s.amount_out_raw, s.usd_out),
        ];
        for (side, asset, raw, value) in legs {
            let (Some(amount_usd), Some(amount)) = (usd(value), units(raw, decimals_of(s.chain_id, asset.as_str()))) else {
                continue;
            };
            out.push(LedgerEvent {
                chain_id: s.chain_id,
                asset: normalize_address(asset),
                side,
                units: amount,
                usd: amount_usd,
                timestamp: s.timestamp,
            });
        }
    }
    out
}

/// Token metadata for the swaps recorded on one chain.
pub struct ChainMetadata<'a, M> {
    pub chain_id: i64,
    pub source: &'a M,
    pub cache: &'a MetadataCache,
}

/// Realized PnL for one trader over its enriched swaps. Decimals are looked
/// up on the chain each swap happened on; chains without a source use 18.
pub async fn evaluate_wallet<M>(
    db: &AsyncDb,
    chains: &[ChainMetadata<'_, M>],
    wallet: &str,
    method: CostBasisMethod,
) -> Result<PnlSummary>
where
    M: TokenMetadataSource + Sync,
{
    let swaps = db.swaps_for_trader(wallet).await?;
    let mut decimals: HashMap<(i64, String), u32> = HashMap::new();
    for s in &swaps {
        let Some(chain) = chains.iter().find(|c| c.chain_id == s.chain_id) else {
            tracing::debug!(wallet, chain_id = s.chain_id, "no metadata source for chain");
            continue;
        };
        for asset in [&s.asset_in, &s.asset_out] {
            let key = (s.chain_id, normalize_address(asset));
            if decimals.contains_key(&key) {
                continue;
            }
            let d = token_metadata_cached(chain.source, chain.cache, &key.1)
                .await?
                .unwrap_or_default()
                .decimals;
            decimals.insert(key, d);
        }
    }
    let ledger = ledger_from_swaps(&swaps, |chain_id, a| {
        decimals.get(&(chain_id, normalize_address(a))).copied().unwrap_or(18)
    });
    let (summary, _) = replay(&ledger, method);
    tracing::debug!(wallet, trades = summary.trades, realized = %summary.realized, "pnl evaluated");
    Ok(summary)
}
