//! Candidate discovery.
//!
//! [`mine_candidates`] looks for traders that were net buyers of value in one
//! block window and net sellers in the next. [`spider_once`] walks new blocks
//! and records both parties of any large ERC-20 transfer as a candidate wallet.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use common::config;
use common::db::AsyncDb;
use common::error::{Error, Result};
use common::providers::{token_metadata_cached, BlockSource, LogSource, MetadataCache, PriceSource, TokenMetadataSource};
use common::types::{normalize_address, same_address, scale_amount, ActivityEvent, LogFilter, NewCandidate, ZERO_ADDRESS};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::decode::{decode_transfer, TRANSFER_TOPIC};
use crate::pricing::{price_or_missing, StableSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub wallet: String,
    pub w1_net: f64,
    pub w1_volume: f64,
    pub w1_swaps: u64,
    pub w2_net: f64,
    pub w2_volume: f64,
    pub w2_swaps: u64,
    /// Distinct chain ids seen across both windows, ascending.
    pub chains: Vec<i64>,
}

#[derive(Debug, Default)]
struct Flow {
    usd_in: f64,
    usd_out: f64,
    volume: f64,
    swaps: u64,
    chains: BTreeSet<i64>,
}

fn aggregate(swaps: &[ActivityEvent]) -> HashMap<String, Flow> {
    let mut out: HashMap<String, Flow> = HashMap::new();
    for s in swaps {
        let flow = out.entry(normalize_address(&s.counterparty_from)).or_default();
        flow.usd_in += s.usd_in.unwrap_or(0.0);
        flow.usd_out += s.usd_out.unwrap_or(0.0);
        flow.volume += s.usd_notional.unwrap_or(0.0);
        flow.swaps += 1;
        flow.chains.insert(s.chain_id);
    }
    out
}

/// Traders active in both block windows with `w1_net >= usd_min` and
/// `w2_net >= usd_min`, sorted by `w2_net` descending.
///
/// `w1_net` is what the trader took out of pools in the first window minus
/// what they put in; `w2_net` is the reverse for the second window.
pub async fn mine_candidates(
    db: &AsyncDb,
    w1: (u64, u64),
    w2: (u64, u64),
    usd_min: f64,
    excluded_labels: &[String],
) -> Result<Vec<Candidate>> {
    let first = aggregate(&db.swaps_in_blocks(w1.0, w1.1).await?);
    let second = aggregate(&db.swaps_in_blocks(w2.0, w2.1).await?);
    let excluded = db.labelled_addresses(excluded_labels.to_vec()).await?;

    let mut out: Vec<Candidate> = first
        .iter()
        .filter(|(wallet, _)| !excluded.contains(*wallet))
        .filter_map(|(wallet, a)| {
            let b = second.get(wallet)?;
            let w1_net = a.usd_out - a.usd_in;
            let w2_net = b.usd_in - b.usd_out;
            if w1_net < usd_min || w2_net < usd_min {
                return None;
            }
            Some(Candidate {
                wallet: wallet.clone(),
                w1_net,
                w1_volume: a.volume,
                w1_swaps: a.swaps,
                w2_net,
                w2_volume: b.volume,
                w2_swaps: b.swaps,
                chains: a.chains.union(&b.chains).copied().collect(),
            })
        })
        .collect();
    out.sort_by(|a, b| b.w2_net.total_cmp(&a.w2_net).then_with(|| a.wallet.cmp(&b.wallet)));

    tracing::info!(
        w1_traders = first.len(),
        w2_traders = second.len(),
        excluded = excluded.len(),
        candidates = out.len(),
        "candidate mining finished"
    );
    Ok(out)
}

// ── Transfer spider ──

#[derive(Debug, Clone)]
pub struct SpiderSettings {
    pub state_path: PathBuf,
    pub start_block: Option<u64>,
    pub max_blocks_per_run: u64,
    pub min_usd_notional: f64,
}

impl From<&config::Mining> for SpiderSettings {
    fn from(m: &config::Mining) -> Self {
        Self {
            state_path: PathBuf::from(&m.spider_state_path),
            start_block: m.spider_start_block,
            max_blocks_per_run: m.spider_max_blocks_per_run,
            min_usd_notional: m.min_usd_notional,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiderState {
    pub last_processed_block: u64,
}

impl SpiderState {
    /// `None` when the file does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let state = serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpiderOutcome {
    pub from_block: u64,
    /// Last block fully scanned; `from_block - 1` when nothing was scanned.
    pub to_block: u64,
    pub large_transfers: u64,
    pub candidates_added: u64,
}

fn is_skippable(address: &str, token: &str) -> bool {
    same_address(address, ZERO_ADDRESS) || same_address(address, token)
}

/// Scan one block's `Transfer` logs and upsert the parties of every transfer
/// worth at least `min_usd`. Returns `(large_transfers, candidates_added)`.
async fn scan_block<C, P>(
    chain: &C,
    prices: &P,
    meta_cache: &MetadataCache,
    stables: &StableSet,
    db: &AsyncDb,
    block: u64,
    min_usd: f64,
) -> Result<(u64, u64)>
where
    C: LogSource + BlockSource + TokenMetadataSource + Sync,
    P: PriceSource + Sync,
{
    let logs = chain
        .logs_in_range(&LogFilter::event(TRANSFER_TOPIC).with_range(block, block))
        .await?;
    if logs.is_empty() {
        return Ok((0, 0));
    }
    let unix = chain.block_timestamp(block).await?;

    let mut large = 0;
    let mut added = 0;
    for transfer in logs.iter().filter_map(decode_transfer) {
        if transfer.amount == 0 {
            continue;
        }
        let Some(meta) = token_metadata_cached(chain, meta_cache, &transfer.token).await? else {
            continue;
        };
        let Some(price) = price_or_missing(prices, stables, &transfer.token, Some(&meta.symbol), unix).await? else {
            continue;
        };
        let amount = scale_amount(transfer.amount, meta.decimals);
        let usd = amount * price;
        if usd < min_usd {
            continue;
        }
        large += 1;
        tracing::debug!(
            block,
            token = %transfer.token,
            from = %transfer.from,
            to = %transfer.to,
            usd = %format!("{usd:.2}"),
            "large transfer"
        );

        for party in [&transfer.from, &transfer.to] {
            if is_skippable(party, &transfer.token) {
                continue;
            }
            let candidate = NewCandidate {
                address: party.clone(),
                detected_at_block: block,
                first_transfer_amount: amount,
                first_transfer_token: Some(transfer.token.clone()),
                first_transfer_decimals: Some(meta.decimals),
            };
            match db.upsert_candidate(&candidate).await {
                Ok(true) => {
                    added += 1;
                    metrics::counter!("evaluator_candidates_discovered_total").increment(1);
                }
                Ok(false) | Err(Error::PersistenceConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok((large, added))
}

/// One spider pass from the persisted block to the chain tip, capped at
/// `max_blocks_per_run`. The last fully scanned block is persisted even when
/// the pass is cancelled or fails part way.
pub async fn spider_once<C, P>(
    chain: &C,
    prices: &P,
    meta_cache: &MetadataCache,
    stables: &StableSet,
    db: &AsyncDb,
    settings: &SpiderSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<SpiderOutcome>
where
    C: LogSource + BlockSource + TokenMetadataSource + Sync,
    P: PriceSource + Sync,
{
    let latest = chain.latest_block().await?;
    let from_block = match SpiderState::load(&settings.state_path)? {
        Some(state) => state.last_processed_block + 1,
        None => settings.start_block.unwrap_or_else(|| latest.saturating_sub(10)),
    };
    let mut outcome = SpiderOutcome {
        from_block,
        to_block: from_block.saturating_sub(1),
        ..SpiderOutcome::default()
    };
    if from_block > latest {
        tracing::debug!(latest, from_block, "no new blocks");
        return Ok(outcome);
    }
    let to_block = latest.min(from_block.saturating_add(settings.max_blocks_per_run.max(1) - 1));
    tracing::info!(from_block, to_block, latest, "spider scanning blocks");

    let mut failure = None;
    for block in from_block..=to_block {
        if cancel.is_cancelled() {
            tracing::info!(block, "spider cancelled");
            break;
        }
        match scan_block(chain, prices, meta_cache, stables, db, block, settings.min_usd_notional).await {
            Ok((large, added)) => {
                outcome.large_transfers += large;
                outcome.candidates_added += added;
                outcome.to_block = block;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if outcome.to_block >= from_block {
        SpiderState {
            last_processed_block: outcome.to_block,
        }
        .save(&settings.state_path)?;
    }
    if let Some(e) = failure {
        return Err(anyhow::Error::new(e).context(format!("spider stopped after block {}", outcome.to_block)));
    }

    tracing::info!(
        from_block,
        to_block = outcome.to_block,
        large_transfers = outcome.large_transfers,
        candidates_added = outcome.candidates_added,
        "spider pass finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{topic_for, uint_word};
    use crate::pricing::tests::{FixedPrices, FlakyPrices, USDC, WETH};
    use chrono::{TimeZone, Utc};
    use common::error::Provider;
    use common::types::{ActivityKind, Dex, RawLog, TokenMetadata};
    use std::sync::atomic::{AtomicU64, Ordering};

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const CAROL: &str = "0x00000000000000000000000000000000000ca201";

    fn swap(trader: &str, chain_id: i64, block: u64, pos: u64, usd_in: f64, usd_out: f64) -> ActivityEvent {
        ActivityEvent {
            chain_id,
            tx_hash: format!("0x{block:x}{pos:x}{chain_id:x}"),
            log_position: pos,
            block,
            timestamp: Utc.with_ymd_and_hms(2025, 10, 10, 20, 0, 0).unwrap(),
            kind: ActivityKind::Swap,
            dex: Some(Dex::UniV3),
            counterparty_from: trader.to_string(),
            counterparty_to: None,
            pool: None,
            asset_in: USDC.to_string(),
            amount_in_raw: 1,
            asset_out: WETH.to_string(),
            amount_out_raw: 1,
            via_aggregator: false,
            usd_in: Some(usd_in),
            usd_out: Some(usd_out),
            usd_notional: Some(usd_in.max(usd_out)),
        }
    }

    async fn seed(db: &AsyncDb, swaps: Vec<ActivityEvent>) {
        db.insert_activity_batch(swaps).await.unwrap();
        for (id, e) in db.unenriched_activity(100).await.unwrap() {
            db.update_activity_usd(id, e.usd_in, e.usd_out, e.usd_notional).await.unwrap();
        }
    }

    async fn label(db: &AsyncDb, address: &str, label: &str) {
        let (address, label) = (address.to_string(), label.to_string());
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO wallet_labels (chain_id, address, label) VALUES (1, ?1, ?2)",
                rusqlite::params![address, label],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mine_requires_both_windows_over_threshold() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed(
            &db,
            vec![
                // alice: +60k out in w1, +50k in over w2 on two chains
                swap(ALICE, 1, 10, 0, 10_000.0, 70_000.0),
                swap(ALICE, 42_161, 110, 0, 80_000.0, 30_000.0),
                // bob: only the first leg clears the threshold
                swap(BOB, 1, 11, 0, 0.0, 50_000.0),
                swap(BOB, 1, 111, 0, 20_000.0, 5_000.0),
                // carol never trades in w2
                swap(CAROL, 1, 12, 0, 0.0, 90_000.0),
            ],
        )
        .await;

        let out = mine_candidates(&db, (0, 99), (100, 199), 30_000.0, &[]).await.unwrap();
        assert_eq!(out.len(), 1);
        let alice = &out[0];
        assert_eq!(alice.wallet, ALICE);
        assert_eq!(alice.w1_net, 60_000.0);
        assert_eq!(alice.w2_net, 50_000.0);
        assert_eq!(alice.w1_volume, 70_000.0);
        assert_eq!(alice.w2_swaps, 1);
        assert_eq!(alice.chains, vec![1, 42_161]);
    }

    #[tokio::test]
    async fn test_mine_excludes_labelled_and_sorts_by_second_window() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed(
            &db,
            vec![
                swap(ALICE, 1, 10, 0, 0.0, 40_000.0),
                swap(ALICE, 1, 110, 0, 40_000.0, 0.0),
                swap(BOB, 1, 11, 0, 0.0, 40_000.0),
                swap(BOB, 1, 111, 0, 90_000.0, 0.0),
                swap(CAROL, 1, 12, 0, 0.0, 40_000.0),
                swap(CAROL, 1, 112, 0, 99_000.0, 0.0),
            ],
        )
        .await;
        label(&db, CAROL, "cex").await;

        let out = mine_candidates(&db, (0, 99), (100, 199), 30_000.0, &["cex".to_string(), "bridge".to_string()])
            .await
            .unwrap();
        let order: Vec<_> = out.iter().map(|c| c.wallet.as_str()).collect();
        assert_eq!(order, vec![BOB, ALICE]);
    }

    /// Transfers of the token at `USDC`, `usdc` whole units each, reported
    /// with `symbol`.
    struct TransferChain {
        latest: u64,
        symbol: &'static str,
        usdc: Vec<(u64, &'static str, &'static str, u128)>,
        fail_at: Option<u64>,
        scanned: AtomicU64,
    }

    impl LogSource for TransferChain {
        async fn logs_in_range(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
            assert_eq!(filter.from_block, filter.to_block);
            let block = filter.from_block;
            if self.fail_at == Some(block) {
                return Err(Error::RateLimited {
                    provider: Provider::Alchemy,
                    retry_after: std::time::Duration::from_secs(60),
                });
            }
            self.scanned.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .usdc
                .iter()
                .filter(|(b, ..)| *b == block)
                .map(|(b, from, to, units)| RawLog {
                    address: USDC.to_string(),
                    topics: vec![TRANSFER_TOPIC.to_string(), topic_for(from), topic_for(to)],
                    data: uint_word(units * 1_000_000),
                    block_number: *b,
                    tx_hash: format!("0x{b:x}"),
                    log_index: 0,
                })
                .collect())
        }
    }

    impl BlockSource for TransferChain {
        async fn latest_block(&self) -> Result<u64> {
            Ok(self.latest)
        }

        async fn block_timestamp(&self, block: u64) -> Result<i64> {
            Ok(1_700_000_000 + block as i64 * 12)
        }
    }

    impl TokenMetadataSource for TransferChain {
        async fn token_metadata(&self, _token: &str) -> Result<TokenMetadata> {
            Ok(TokenMetadata {
                decimals: 6,
                symbol: self.symbol.to_string(),
            })
        }
    }

    fn settings(dir: &tempfile::TempDir) -> SpiderSettings {
        SpiderSettings {
            state_path: dir.path().join("spider_state.json"),
            start_block: Some(100),
            max_blocks_per_run: 5,
            min_usd_notional: 30_000.0,
        }
    }

    #[tokio::test]
    async fn test_spider_records_large_transfers_and_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = TransferChain {
            latest: 200,
            symbol: "USDC",
            usdc: vec![
                (100, ALICE, BOB, 50_000),
                (101, ALICE, CAROL, 10),
                (102, ZERO_ADDRESS, CAROL, 75_000),
            ],
            fail_at: None,
            scanned: AtomicU64::new(0),
        };
        let s = settings(&dir);
        let out = spider_once(
            &chain,
            &FixedPrices::default(),
            &MetadataCache::default(),
            &StableSet::new([USDC]),
            &db,
            &s,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            out,
            SpiderOutcome {
                from_block: 100,
                to_block: 104,
                large_transfers: 2,
                candidates_added: 3,
            }
        );
        assert_eq!(chain.scanned.load(Ordering::SeqCst), 5);
        let bob = db.candidate_by_address(BOB).await.unwrap().unwrap();
        assert_eq!(bob.detected_at_block, 100);
        assert_eq!(bob.first_transfer_decimals, Some(6));
        assert!(db.candidate_by_address(ZERO_ADDRESS).await.unwrap().is_none());
        assert_eq!(
            SpiderState::load(&s.state_path).unwrap(),
            Some(SpiderState {
                last_processed_block: 104
            })
        );

        // Second pass resumes after the persisted block; re-seen wallets are not re-added.
        let again = spider_once(
            &chain,
            &FixedPrices::default(),
            &MetadataCache::default(),
            &StableSet::new([USDC]),
            &db,
            &s,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(again.from_block, 105);
        assert_eq!(again.candidates_added, 0);
    }

    #[tokio::test]
    async fn test_spider_persists_progress_before_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = TransferChain {
            latest: 200,
            symbol: "USDC",
            usdc: vec![],
            fail_at: Some(102),
            scanned: AtomicU64::new(0),
        };
        let s = settings(&dir);
        let err = spider_once(
            &chain,
            &FixedPrices::default(),
            &MetadataCache::default(),
            &StableSet::new([USDC]),
            &db,
            &s,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_rate_limited));
        assert_eq!(
            SpiderState::load(&s.state_path).unwrap(),
            Some(SpiderState {
                last_processed_block: 101
            })
        );
    }

    #[tokio::test]
    async fn test_spider_cancelled_scans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = TransferChain {
            latest: 200,
            symbol: "USDC",
            usdc: vec![(100, ALICE, BOB, 50_000)],
            fail_at: None,
            scanned: AtomicU64::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let s = settings(&dir);
        let out = spider_once(
            &chain,
            &FixedPrices::default(),
            &MetadataCache::default(),
            &StableSet::new([USDC]),
            &db,
            &s,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.to_block, 99);
        assert_eq!(chain.scanned.load(Ordering::SeqCst), 0);
        assert_eq!(SpiderState::load(&s.state_path).unwrap(), None);
    }

    #[tokio::test]
    async fn test_spider_skips_unpriceable_transfers_and_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = TransferChain {
            latest: 200,
            symbol: "PEPE",
            usdc: vec![(100, ALICE, BOB, 50_000), (103, ALICE, CAROL, 60_000)],
            fail_at: None,
            scanned: AtomicU64::new(0),
        };
        let prices = FlakyPrices::default();
        let s = settings(&dir);
        let out = spider_once(
            &chain,
            &prices,
            &MetadataCache::default(),
            &StableSet::default(),
            &db,
            &s,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.to_block, 104);
        assert_eq!(out.large_transfers, 0);
        assert_eq!(prices.calls.load(Ordering::SeqCst), 2);
        assert!(db.candidate_by_address(BOB).await.unwrap().is_none());
        assert_eq!(
            SpiderState::load(&s.state_path).unwrap(),
            Some(SpiderState {
                last_processed_block: 104
            })
        );
    }
}
