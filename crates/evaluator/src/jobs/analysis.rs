//! The resumable analysis loop: values every pending candidate wallet over the
//! configured window and persists one `WalletAnalysis` per wallet.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use common::config::{self, AnalysisWindow};
use common::db::AsyncDb;
use common::error::{self, Error, Provider};
use common::providers::{
    BalanceSource, BlockExplorer, BlockSource, MetadataCache, PriceSource, TokenMetadataSource, TransferSource,
};
use common::types::CandidateWallet;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{AnalysisCheckpoint, CheckpointStore};
use crate::jobs::export::export_snapshot;
use crate::pricing::StableSet;
use crate::valuation::{ValuationSettings, Valuer};
use crate::window::{resolve_window, BlockLocator, ResolvedWindow};

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub batch_size: usize,
    pub max_rate_limit_attempts: u32,
    pub rate_limit_backoff: Duration,
    pub progress_log_every: u64,
    pub snapshot_every: u64,
    pub snapshot_path: PathBuf,
    pub snapshot_limit: usize,
}

impl From<&config::Analysis> for AnalysisSettings {
    fn from(cfg: &config::Analysis) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_rate_limit_attempts: cfg.max_rate_limit_attempts.max(1),
            rate_limit_backoff: Duration::from_secs(cfg.rate_limit_backoff_secs),
            progress_log_every: cfg.progress_log_every,
            snapshot_every: cfg.snapshot_every,
            snapshot_path: PathBuf::from(&cfg.snapshot_path),
            snapshot_limit: cfg.snapshot_limit,
        }
    }
}

/// Everything one analysis run needs.
pub struct AnalysisContext<'a, C, E, P> {
    pub db: &'a AsyncDb,
    pub chain: &'a C,
    pub locator: BlockLocator<'a, E, C>,
    pub prices: &'a P,
    pub window: &'a AnalysisWindow,
    pub meta_cache: MetadataCache,
    pub stables: StableSet,
    pub valuation: ValuationSettings,
    pub checkpoints: CheckpointStore,
    pub settings: AnalysisSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { processed: u64 },
    RateLimited { provider: Provider, retry_after: Duration },
    Cancelled { processed: u64 },
}

enum WalletResult {
    Done,
    Skipped,
    Cancelled,
}

async fn analyze_one<C, P>(
    valuer: &Valuer<'_, C, P>,
    db: &AsyncDb,
    wallet: &CandidateWallet,
    window: &ResolvedWindow,
) -> error::Result<()>
where
    C: BalanceSource + TokenMetadataSource + TransferSource + Sync,
    P: PriceSource + Sync,
{
    let valuation = valuer.value_wallet(wallet, window).await?;
    db.record_analysis(&valuation.into_analysis(wallet.id, window)).await
}

/// Analyze one wallet, retrying rate limits up to the configured ceiling.
async fn process_wallet<C, E, P>(
    ctx: &AnalysisContext<'_, C, E, P>,
    valuer: &Valuer<'_, C, P>,
    checkpoint: &mut AnalysisCheckpoint,
    wallet: &CandidateWallet,
    window: &ResolvedWindow,
    cancel: &CancellationToken,
) -> Result<WalletResult>
where
    C: BlockSource + BalanceSource + TokenMetadataSource + TransferSource + Sync,
    E: BlockExplorer + Sync,
    P: PriceSource + Sync,
{
    let max_attempts = ctx.settings.max_rate_limit_attempts;
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::debug!(wallet = %wallet.address, id = wallet.id, attempt, "analyzing wallet");
        match analyze_one(valuer, ctx.db, wallet, window).await {
            Ok(()) => {
                ctx.checkpoints
                    .mark_wallet_processed(checkpoint, wallet.id, &wallet.address)
                    .await?;
                metrics::counter!("evaluator_wallets_analyzed_total").increment(1);
                return Ok(WalletResult::Done);
            }
            Err(Error::PersistenceConflict(msg)) => {
                tracing::info!(wallet = %wallet.address, %msg, "analysis already stored");
                ctx.db.mark_analyzed(wallet.id).await?;
                ctx.checkpoints
                    .mark_wallet_processed(checkpoint, wallet.id, &wallet.address)
                    .await?;
                return Ok(WalletResult::Done);
            }
            Err(Error::RateLimited { provider, retry_after }) => {
                metrics::counter!("evaluator_rate_limits_total", "provider" => provider.as_str()).increment(1);
                if attempt >= max_attempts {
                    tracing::error!(
                        wallet = %wallet.address,
                        %provider,
                        attempts = attempt,
                        "rate limit persisted; giving up on wallet"
                    );
                    ctx.checkpoints
                        .record_error(
                            checkpoint,
                            format!(
                                "Error at wallet {}: rate limited by {provider} after {attempt} attempts",
                                wallet.id
                            ),
                        )
                        .await?;
                    return Ok(WalletResult::Skipped);
                }
                let backoff = ctx.settings.rate_limit_backoff;
                tracing::warn!(
                    wallet = %wallet.address,
                    %provider,
                    attempt,
                    max_attempts,
                    suggested = ?retry_after,
                    backoff = ?backoff,
                    "rate limited; backing off"
                );
                ctx.checkpoints.mark_rate_limited(checkpoint, provider, backoff).await?;
                tokio::select! {
                    () = cancel.cancelled() => return Ok(WalletResult::Cancelled),
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            Err(Error::Cancelled) => return Ok(WalletResult::Cancelled),
            Err(e) => {
                tracing::error!(wallet = %wallet.address, error = %e, "wallet analysis failed");
                ctx.checkpoints
                    .record_error(checkpoint, format!("Error at wallet {}: {e}", wallet.id))
                    .await?;
                return Ok(WalletResult::Skipped);
            }
        }
    }
}

async fn snapshot(db: &AsyncDb, window: &ResolvedWindow, settings: &AnalysisSettings) {
    if let Err(e) = export_snapshot(db, window, &settings.snapshot_path, settings.snapshot_limit).await {
        tracing::error!(error = %e, "snapshot export failed");
    }
}

/// Run (or resume) the analysis of every pending wallet for the configured window.
pub async fn run_analysis<C, E, P>(ctx: &AnalysisContext<'_, C, E, P>, cancel: &CancellationToken) -> Result<RunOutcome>
where
    C: BlockSource + BalanceSource + TokenMetadataSource + TransferSource + Sync,
    E: BlockExplorer + Sync,
    P: PriceSource + Sync,
{
    let window = match resolve_window(ctx.window, Utc::now(), &ctx.locator).await {
        Ok(w) => w,
        Err(Error::RateLimited { provider, retry_after }) => {
            metrics::counter!("evaluator_rate_limits_total", "provider" => provider.as_str()).increment(1);
            tracing::warn!(%provider, ?retry_after, "rate limited while resolving the window");
            return Ok(RunOutcome::RateLimited { provider, retry_after });
        }
        Err(e) => return Err(e.into()),
    };
    let key = window.key();

    let existing = ctx.checkpoints.load(&key).await?;
    if let Some(cp) = &existing {
        if let (true, Some(provider), Some(until)) = (cp.rate_limit_hit, cp.rate_limit_provider, cp.next_retry_after) {
            if let Ok(wait) = (until - Utc::now()).to_std() {
                tracing::info!(%provider, retry_at = %until, "still inside a rate-limit window");
                return Ok(RunOutcome::RateLimited {
                    provider,
                    retry_after: wait,
                });
            }
        }
    }

    let pending = ctx.db.count_pending_wallets().await?;
    let mut checkpoint = match existing {
        Some(cp) if cp.completed && pending == 0 => {
            tracing::info!(processed = cp.processed_count, "window already analyzed");
            return Ok(RunOutcome::Completed {
                processed: cp.processed_count,
            });
        }
        Some(cp) if !cp.completed => cp,
        // A finished window with new pending wallets gets a fresh pass.
        _ => ctx.checkpoints.create_new(&key, pending),
    };
    checkpoint.rate_limit_hit = false;
    checkpoint.aborted = false;
    ctx.checkpoints.save(&mut checkpoint).await?;

    let valuer = Valuer::new(
        ctx.chain,
        ctx.prices,
        ctx.meta_cache.clone(),
        ctx.stables.clone(),
        ctx.valuation.clone(),
    );
    let mut cursor = checkpoint.last_processed_wallet_id;
    tracing::info!(window_key = %key, pending, resume_after = cursor, "analysis run starting");

    let result: Result<RunOutcome> = async {
        loop {
            let batch = ctx.db.pending_wallets(cursor, ctx.settings.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            for wallet in &batch {
                if cancel.is_cancelled() {
                    ctx.checkpoints.save(&mut checkpoint).await?;
                    tracing::info!(processed = checkpoint.processed_count, "analysis cancelled");
                    return Ok(RunOutcome::Cancelled {
                        processed: checkpoint.processed_count,
                    });
                }
                cursor = wallet.id;
                match process_wallet(ctx, &valuer, &mut checkpoint, wallet, &window, cancel).await? {
                    WalletResult::Done => {
                        let n = checkpoint.processed_count;
                        if ctx.settings.progress_log_every > 0 && n % ctx.settings.progress_log_every == 0 {
                            checkpoint.log_progress();
                        }
                        if ctx.settings.snapshot_every > 0 && n % ctx.settings.snapshot_every == 0 {
                            snapshot(ctx.db, &window, &ctx.settings).await;
                        }
                    }
                    WalletResult::Skipped => {}
                    WalletResult::Cancelled => {
                        ctx.checkpoints.save(&mut checkpoint).await?;
                        return Ok(RunOutcome::Cancelled {
                            processed: checkpoint.processed_count,
                        });
                    }
                }
            }
        }

        ctx.checkpoints.mark_completed(&mut checkpoint).await?;
        snapshot(ctx.db, &window, &ctx.settings).await;
        Ok(RunOutcome::Completed {
            processed: checkpoint.processed_count,
        })
    }
    .await;

    if let Err(e) = &result {
        let msg = format!("{e:#}");
        tracing::error!(error = %msg, processed = checkpoint.processed_count, "analysis run aborted");
        if let Err(save) = ctx.checkpoints.mark_aborted(&mut checkpoint, &msg).await {
            tracing::warn!(error = %save, "failed to persist aborted checkpoint");
        }
    }
    result
}
