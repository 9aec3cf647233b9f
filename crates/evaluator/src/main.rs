use anyhow::Result;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::config::{ChainEndpoint, Config};
use common::db::AsyncDb;
use common::providers::explorer::EtherscanClient;
use common::providers::prices::{CachedPrices, CoinGeckoClient, DefiLlamaClient, FallbackPrices};
use common::providers::rpc::AlchemyClient;
use common::providers::{BlockTimeCache, MetadataCache, PriceCache};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

mod checkpoint;
mod cli;
mod collector;
mod decode;
mod jobs;
mod metrics;
mod mining;
mod pnl;
mod pricing;
mod scheduler;
mod scoring;
mod valuation;
mod window;

use checkpoint::CheckpointStore;
use cli::{BlockRange, Command};
use jobs::{AnalysisContext, AnalysisSettings, JobTracker, RunOutcome};
use pnl::CostBasisMethod;
use pricing::{EnrichSummary, StableSet};
use window::BlockLocator;

type Prices = CachedPrices<FallbackPrices<CoinGeckoClient, DefiLlamaClient>>;

/// RPC, price and metadata clients for one configured network.
struct ChainRuntime {
    endpoint: ChainEndpoint,
    rpc: AlchemyClient,
    prices: Prices,
    meta_cache: MetadataCache,
}

impl ChainRuntime {
    fn build(cfg: &common::config::Providers, endpoint: ChainEndpoint) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.request_timeout_secs);
        let rpc = AlchemyClient::for_chain(cfg, &endpoint)?;
        let prices = CachedPrices::new(
            FallbackPrices::new(
                CoinGeckoClient::new(&cfg.coingecko_url, &cfg.coingecko_api_key, timeout)?
                    .with_platform(&endpoint.coingecko_platform),
                DefiLlamaClient::new(&cfg.defillama_url, timeout)?.with_chain(&endpoint.defillama_chain),
            ),
            PriceCache::new(cfg.price_cache_ttl_secs.map(Duration::from_secs)),
        );
        tracing::info!(chain = %endpoint.name, chain_id = endpoint.chain_id, "chain configured");
        Ok(Self {
            endpoint,
            rpc,
            prices,
            meta_cache: MetadataCache::default(),
        })
    }
}

/// Long-lived clients and caches shared by every job in the process.
/// Analysis and the spider run against the primary chain; collection,
/// enrichment and scoring cover every configured chain.
struct App {
    cfg: Config,
    db: AsyncDb,
    primary: ChainRuntime,
    extra: Vec<ChainRuntime>,
    explorer: Option<EtherscanClient>,
    block_cache: BlockTimeCache,
    stables: StableSet,
}

/// Run `job` with its lifecycle recorded in `job_status`.
async fn tracked<T, F>(db: &AsyncDb, name: &str, job: F) -> Result<T>
where
    T: Serialize,
    F: Future<Output = Result<T>>,
{
    let tracker = JobTracker::start(db, name).await?;
    match job.await {
        Ok(v) => {
            tracker.success(serde_json::to_value(&v).ok()).await?;
            Ok(v)
        }
        Err(e) => {
            tracker.fail(&e).await?;
            Err(e)
        }
    }
}

impl App {
    async fn build(cfg: Config) -> Result<Self> {
        let p = &cfg.providers;
        let timeout = Duration::from_secs(p.request_timeout_secs);

        let primary = ChainRuntime::build(p, p.primary_chain())?;
        let extra = p
            .chains()
            .into_iter()
            .skip(1)
            .map(|endpoint| ChainRuntime::build(p, endpoint))
            .collect::<Result<Vec<_>>>()?;
        let explorer = if p.use_explorer_block_lookup && !p.etherscan_api_key.is_empty() {
            Some(EtherscanClient::new(&p.etherscan_url, &p.etherscan_api_key, timeout)?)
        } else {
            tracing::info!("explorer block lookup disabled; using block timestamp search");
            None
        };
        let stables = StableSet::new(&cfg.valuation.stablecoins);

        if let Some(parent) = Path::new(&cfg.database.path).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = AsyncDb::open(&cfg.database.path).await?;

        Ok(Self {
            cfg,
            db,
            primary,
            extra,
            explorer,
            block_cache: BlockTimeCache::default(),
            stables,
        })
    }

    fn chains(&self) -> impl Iterator<Item = &ChainRuntime> {
        std::iter::once(&self.primary).chain(&self.extra)
    }

    fn locator(&self) -> BlockLocator<'_, EtherscanClient, AlchemyClient> {
        match &self.explorer {
            Some(explorer) => BlockLocator::Explorer {
                explorer,
                cache: self.block_cache.clone(),
            },
            None => BlockLocator::Search { blocks: &self.primary.rpc },
        }
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(&self.cfg.checkpoint.dir)
    }

    async fn analyze(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let ctx = AnalysisContext {
            db: &self.db,
            chain: &self.primary.rpc,
            locator: self.locator(),
            prices: &self.primary.prices,
            window: &self.cfg.analysis_window,
            meta_cache: self.primary.meta_cache.clone(),
            stables: self.stables.clone(),
            valuation: (&self.cfg.valuation).into(),
            checkpoints: self.checkpoints(),
            settings: AnalysisSettings::from(&self.cfg.analysis),
        };
        tracked(&self.db, "analysis", jobs::run_analysis(&ctx, cancel)).await
    }

    async fn spider(&self, cancel: &CancellationToken) -> Result<mining::SpiderOutcome> {
        let settings = mining::SpiderSettings::from(&self.cfg.mining);
        tracked(
            &self.db,
            "spider",
            mining::spider_once(
                &self.primary.rpc,
                &self.primary.prices,
                &self.primary.meta_cache,
                &self.stables,
                &self.db,
                &settings,
                cancel,
            ),
        )
        .await
    }

    async fn collect(&self, chain: &str, from: u64, to: u64, cancel: &CancellationToken) -> Result<u64> {
        let id = chain.parse::<i64>().ok();
        let Some(rt) = self
            .chains()
            .find(|c| c.endpoint.name.eq_ignore_ascii_case(chain) || Some(c.endpoint.chain_id) == id)
        else {
            let known: Vec<&str> = self.chains().map(|c| c.endpoint.name.as_str()).collect();
            anyhow::bail!("chain {chain} is not configured (known: {})", known.join(", "));
        };
        let span = self.cfg.collector.span_for(&rt.endpoint.name);
        let job = async {
            anyhow::Ok(
                collector::collect_and_store(&rt.rpc, &self.db, rt.endpoint.chain_id, from, to, span, cancel).await?,
            )
        };
        tracked(&self.db, "collect", job).await
    }

    async fn enrich(&self) -> Result<EnrichSummary> {
        let job = async {
            let mut total = EnrichSummary::default();
            for rt in self.chains() {
                let s = pricing::enrich_activity(
                    &self.db,
                    rt.endpoint.chain_id,
                    &rt.prices,
                    &rt.rpc,
                    &rt.meta_cache,
                    &self.stables,
                    self.cfg.mining.min_usd_notional,
                )
                .await?;
                total.priced += s.priced;
                total.missing += s.missing;
                total.filtered += s.filtered;
            }
            anyhow::Ok(total)
        };
        tracked(&self.db, "enrich", job).await
    }

    async fn mine(&self, w1: BlockRange, w2: BlockRange) -> Result<Vec<mining::Candidate>> {
        Ok(mining::mine_candidates(
            &self.db,
            w1,
            w2,
            self.cfg.mining.min_usd_notional,
            &self.cfg.mining.excluded_labels,
        )
        .await?)
    }

    async fn score(
        &self,
        w1: BlockRange,
        w2: BlockRange,
        method: Option<CostBasisMethod>,
    ) -> Result<Vec<scoring::ScoredWallet>> {
        let method = match method {
            Some(m) => m,
            None => self
                .cfg
                .scoring
                .pnl_mode
                .as_deref()
                .map(str::parse::<CostBasisMethod>)
                .transpose()?
                .unwrap_or_default(),
        };
        let candidates = self.mine(w1, w2).await?;
        let chains: Vec<_> = self
            .chains()
            .map(|rt| pnl::ChainMetadata {
                chain_id: rt.endpoint.chain_id,
                source: &rt.rpc,
                cache: &rt.meta_cache,
            })
            .collect();
        let mut pnl = Vec::with_capacity(candidates.len());
        for c in &candidates {
            let summary = pnl::evaluate_wallet(&self.db, &chains, &c.wallet, method).await?;
            pnl.push((c.wallet.clone(), summary));
        }
        Ok(scoring::score(&candidates, &pnl, &self.cfg.scoring.weights))
    }

    async fn export(&self, path: &Path) -> Result<usize> {
        let window = window::resolve_window(&self.cfg.analysis_window, chrono::Utc::now(), &self.locator()).await?;
        jobs::export_snapshot(&self.db, &window, path, self.cfg.analysis.snapshot_limit).await
    }

    async fn status(&self) -> Result<()> {
        let checkpoint = self.checkpoints().peek().await?;
        let statuses = jobs::job_statuses(&self.db).await?;
        cli::print_status(checkpoint.as_ref(), &statuses);
        Ok(())
    }
}

fn log_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { processed } => tracing::info!(processed, "analysis done"),
        RunOutcome::RateLimited { provider, retry_after } => {
            tracing::warn!(%provider, retry_after_secs = retry_after.as_secs(), "analysis paused by rate limit");
        }
        RunOutcome::Cancelled { processed } => tracing::info!(processed, "analysis cancelled"),
    }
}

async fn run_command(app: &Arc<App>, cmd: Command, cancel: &CancellationToken) -> Result<()> {
    match cmd {
        Command::Run => run_service(app, cancel).await?,
        Command::Analyze => log_outcome(&app.analyze(cancel).await?),
        Command::Collect { chain, from, to } => {
            let stored = app.collect(&chain, from, to, cancel).await?;
            println!("stored {stored} new activity rows");
        }
        Command::Enrich => {
            let s = app.enrich().await?;
            println!("priced={} missing={} filtered={}", s.priced, s.missing, s.filtered);
        }
        Command::Spider => {
            let o = app.spider(cancel).await?;
            println!(
                "scanned {}..={} large_transfers={} candidates_added={}",
                o.from_block, o.to_block, o.large_transfers, o.candidates_added
            );
        }
        Command::Mine { w1, w2 } => cli::print_candidates(&app.mine(w1, w2).await?),
        Command::Score { w1, w2, method } => cli::print_scores(&app.score(w1, w2, method).await?),
        Command::Status => app.status().await?,
        Command::Export { path } => {
            let n = app.export(&path).await?;
            println!("wrote {n} rows to {}", path.display());
        }
    }
    Ok(())
}

/// Scheduler loop: analysis ticks plus optional spider ticks until cancelled.
async fn run_service(app: &Arc<App>, cancel: &CancellationToken) -> Result<()> {
    metrics::install_prometheus(app.cfg.observability.prometheus_port)?;
    metrics::describe();

    let (analysis_tx, mut analysis_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (spider_tx, mut spider_rx) = tokio::sync::mpsc::channel::<()>(1);

    let mut specs = vec![scheduler::JobSpec {
        name: "analysis".to_string(),
        interval: Duration::from_secs(app.cfg.analysis.interval_secs.max(1)),
        tick: analysis_tx,
        run_immediately: true,
    }];
    if app.cfg.mining.spider_enabled {
        specs.push(scheduler::JobSpec {
            name: "spider".to_string(),
            interval: Duration::from_secs(app.cfg.mining.spider_interval_secs.max(1)),
            tick: spider_tx,
            run_immediately: true,
        });
    } else {
        drop(spider_tx);
    }

    let analysis_worker = tokio::spawn({
        let app = app.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    tick = analysis_rx.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        let span = tracing::info_span!("job_run", job = "analysis");
                        match app.analyze(&cancel).instrument(span).await {
                            Ok(outcome) => log_outcome(&outcome),
                            Err(e) => tracing::error!(error = %e, "analysis failed"),
                        }
                    }
                }
            }
        }
    });

    let spider_worker = tokio::spawn({
        let app = app.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    tick = spider_rx.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        let span = tracing::info_span!("job_run", job = "spider");
                        match app.spider(&cancel).instrument(span).await {
                            Ok(o) => tracing::info!(candidates_added = o.candidates_added, "spider done"),
                            Err(e) => tracing::error!(error = %e, "spider failed"),
                        }
                    }
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(specs);
    tracing::info!("scheduler started");

    cancel.cancelled().await;
    tracing::info!("shutting down; waiting for workers to reach a checkpoint");
    let _ = tokio::join!(analysis_worker, spider_worker);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let (dispatch, _otel_guard) = common::observability::build_dispatch("evaluator", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    tracing::info!(command = ?cmd, "evaluator starting");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                cancel.cancel();
            }
        }
    });

    let app = Arc::new(App::build(config).await?);
    run_command(&app, cmd, &cancel).await
}
