use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use common::db::AsyncDb;
use common::error::{Error, Provider, Result};
use common::providers::{BlockSource, LogSource, TransactionSource, TransferSource};
use common::types::{
    normalize_address, parse_hex_u128, same_address, scale_amount, ActivityEvent, ActivityKind, AssetTransfer, Dex,
    LogFilter, RawLog, TxInfo,
};
use tokio_util::sync::CancellationToken;

use crate::decode::{decode_v2_swap, decode_v3_swap, DecodedSwap, UNIV2_SWAP_TOPIC, UNIV3_SWAP_TOPIC};

/// Fetch every log matching `filter` in `[from_block, to_block]`.
///
/// Chunks start at `default_span`. A range rejection halves the span (floor 1)
/// and retries the same cursor; each success doubles it back up to the default.
/// Output is sorted by `(block, log_index)` and deduplicated.
pub async fn fetch_logs_chunked<L>(
    source: &L,
    filter: &LogFilter,
    from_block: u64,
    to_block: u64,
    default_span: u64,
    cancel: &CancellationToken,
) -> Result<Vec<RawLog>>
where
    L: LogSource + Sync,
{
    let default_span = default_span.max(1);
    let mut span = default_span;
    let mut cursor = from_block;
    let mut logs = Vec::new();

    while cursor <= to_block {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let chunk_end = cursor.saturating_add(span - 1).min(to_block);
        match source.logs_in_range(&filter.with_range(cursor, chunk_end)).await {
            Ok(chunk) => {
                logs.extend(chunk);
                cursor = chunk_end + 1;
                span = (span * 2).min(default_span);
            }
            Err(e) if e.is_range_too_large() => {
                let next = (span / 2).max(1);
                tracing::debug!(cursor, span, next, "block range rejected; shrinking span");
                if span == 1 {
                    return Err(e);
                }
                span = next;
            }
            Err(e) => return Err(e),
        }
    }

    logs.sort_by_key(|l| (l.block_number, l.log_index));
    logs.dedup_by_key(|l| (l.block_number, l.log_index));
    Ok(logs)
}

#[derive(Debug, Default)]
pub struct CollectResult {
    pub items: Vec<ActivityEvent>,
    pub total_logs: usize,
}

/// Lookups memoized for the duration of one collection run.
#[derive(Default)]
struct RunCaches {
    block_times: HashMap<u64, DateTime<Utc>>,
    txs: HashMap<String, TxInfo>,
    pools: HashMap<String, (String, String)>,
}

impl RunCaches {
    async fn block_time<C: BlockSource + Sync>(&mut self, chain: &C, block: u64) -> Result<DateTime<Utc>> {
        if let Some(t) = self.block_times.get(&block) {
            return Ok(*t);
        }
        let unix = chain.block_timestamp(block).await?;
        let t = Utc
            .timestamp_opt(unix, 0)
            .single()
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("block {block} has bad timestamp {unix}")))?;
        self.block_times.insert(block, t);
        Ok(t)
    }

    async fn tx<C: TransactionSource + Sync>(&mut self, chain: &C, hash: &str) -> Result<TxInfo> {
        let key = hash.to_ascii_lowercase();
        if let Some(t) = self.txs.get(&key) {
            return Ok(t.clone());
        }
        let info = chain.transaction(&key).await?;
        self.txs.insert(key, info.clone());
        Ok(info)
    }

    async fn pool<C: TransactionSource + Sync>(&mut self, chain: &C, pool: &str) -> Result<(String, String)> {
        if let Some(p) = self.pools.get(pool) {
            return Ok(p.clone());
        }
        let tokens = chain.pool_tokens(pool).await?;
        self.pools.insert(pool.to_string(), tokens.clone());
        Ok(tokens)
    }
}

/// Collect Uniswap V2 and V3 swaps in `[from_block, to_block]` as activity rows.
pub async fn collect_swaps<C>(
    chain: &C,
    chain_id: i64,
    from_block: u64,
    to_block: u64,
    default_span: u64,
    cancel: &CancellationToken,
) -> Result<CollectResult>
where
    C: LogSource + TransactionSource + BlockSource + Sync,
{
    let v2 = fetch_logs_chunked(
        chain,
        &LogFilter::event(UNIV2_SWAP_TOPIC),
        from_block,
        to_block,
        default_span,
        cancel,
    )
    .await?;
    let v3 = fetch_logs_chunked(
        chain,
        &LogFilter::event(UNIV3_SWAP_TOPIC),
        from_block,
        to_block,
        default_span,
        cancel,
    )
    .await?;
    let total_logs = v2.len() + v3.len();

    let mut caches = RunCaches::default();
    let mut items = Vec::with_capacity(total_logs);
    let tagged = v2
        .into_iter()
        .map(|l| (Dex::UniV2, l))
        .chain(v3.into_iter().map(|l| (Dex::UniV3, l)));

    for (dex, log) in tagged {
        let decoded = match dex {
            Dex::UniV2 => decode_v2_swap(&log),
            Dex::UniV3 => decode_v3_swap(&log),
        };
        let Some(swap) = decoded else {
            tracing::debug!(tx = %log.tx_hash, log_index = log.log_index, "undecodable swap log");
            continue;
        };
        if swap.amount_in == 0 || swap.amount_out == 0 {
            continue;
        }
        let pool = normalize_address(&log.address);
        let timestamp = caches.block_time(chain, log.block_number).await?;
        let tx = caches.tx(chain, &log.tx_hash).await?;
        let tokens = caches.pool(chain, &pool).await?;
        items.push(swap_event(chain_id, dex, &log, &pool, timestamp, &tx, &tokens, &swap));
    }

    items.sort_by_key(|e| (e.block, e.log_position));
    tracing::info!(chain_id, from_block, to_block, total_logs, swaps = items.len(), "swaps collected");
    Ok(CollectResult { items, total_logs })
}

#[allow(clippy::too_many_arguments)]
fn swap_event(
    chain_id: i64,
    dex: Dex,
    log: &RawLog,
    pool: &str,
    timestamp: DateTime<Utc>,
    tx: &TxInfo,
    tokens: &(String, String),
    swap: &DecodedSwap,
) -> ActivityEvent {
    let (asset_in, asset_out) = if swap.token0_in {
        (tokens.0.clone(), tokens.1.clone())
    } else {
        (tokens.1.clone(), tokens.0.clone())
    };
    let routed = tx.to.as_deref().is_some_and(|to| !same_address(to, pool));
    let via_aggregator = match dex {
        Dex::UniV2 => routed,
        Dex::UniV3 => routed || !same_address(&swap.recipient, &tx.from),
    };
    ActivityEvent {
        chain_id,
        tx_hash: log.tx_hash.to_ascii_lowercase(),
        log_position: log.log_index,
        block: log.block_number,
        timestamp,
        kind: ActivityKind::Swap,
        dex: Some(dex),
        counterparty_from: tx.from.clone(),
        counterparty_to: tx.to.clone(),
        pool: Some(pool.to_string()),
        asset_in,
        amount_in_raw: swap.amount_in,
        asset_out,
        amount_out_raw: swap.amount_out,
        via_aggregator,
        usd_in: None,
        usd_out: None,
        usd_notional: None,
    }
}

/// Collect swaps and persist them. Returns the number of new rows.
pub async fn collect_and_store<C>(
    chain: &C,
    db: &AsyncDb,
    chain_id: i64,
    from_block: u64,
    to_block: u64,
    default_span: u64,
    cancel: &CancellationToken,
) -> Result<u64>
where
    C: LogSource + TransactionSource + BlockSource + Sync,
{
    let result = collect_swaps(chain, chain_id, from_block, to_block, default_span, cancel).await?;
    let inserted = db.insert_activity_batch(result.items).await?;
    metrics::counter!("evaluator_activity_events_total").increment(inserted);
    Ok(inserted)
}

/// A wallet transfer with its amount resolved to whole units.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransfer {
    pub block: u64,
    pub log_position: u64,
    pub hash: String,
    pub from: String,
    pub to: String,
    /// `None` for native ETH.
    pub token: Option<String>,
    pub amount: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

fn resolve_amount(t: &AssetTransfer) -> Option<f64> {
    if let Some(v) = t.value {
        return Some(v);
    }
    let raw = parse_hex_u128(t.raw_value.as_deref()?)?;
    Some(scale_amount(raw, t.decimals.unwrap_or(18)))
}

/// Deduplicate, resolve amounts, drop zero or unreadable values and sort by
/// `(block, log_position)`.
pub fn normalize_transfers(transfers: Vec<AssetTransfer>) -> Vec<WalletTransfer> {
    let mut seen_ids = HashSet::new();
    let mut seen_positions = HashSet::new();
    let mut out = Vec::with_capacity(transfers.len());

    for t in transfers {
        let fresh = match &t.unique_id {
            Some(id) => seen_ids.insert(id.clone()),
            None => seen_positions.insert((t.hash.to_ascii_lowercase(), t.block, t.log_position)),
        };
        if !fresh {
            continue;
        }
        let Some(amount) = resolve_amount(&t).filter(|a| a.is_finite() && *a > 0.0) else {
            continue;
        };
        out.push(WalletTransfer {
            block: t.block,
            log_position: t.log_position,
            hash: t.hash,
            from: t.from,
            to: t.to,
            token: t.token,
            amount,
            timestamp: t.timestamp,
        });
    }

    out.sort_by_key(|t| (t.block, t.log_position));
    out
}

pub async fn collect_wallet_transfers<T>(
    source: &T,
    wallet: &str,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<WalletTransfer>>
where
    T: TransferSource + Sync,
{
    let raw = source.asset_transfers(wallet, from_block, to_block).await?;
    Ok(normalize_transfers(raw))
}
