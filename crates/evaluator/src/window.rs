use chrono::{DateTime, Duration, Timelike, Utc};
use common::config::AnalysisWindow;
use common::error::{Error, Result};
use common::providers::{BlockExplorer, BlockSource, BlockTimeCache};
use common::types::BlockDirection;

/// Upper bound on timestamp probes during binary search.
pub const MAX_SEARCH_PROBES: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub t0: DateTime<Utc>,
    pub t1: DateTime<Utc>,
}

impl WindowBounds {
    pub fn key(&self) -> String {
        window_key(self.t0, self.t1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub t0: DateTime<Utc>,
    pub t1: DateTime<Utc>,
    pub t0_block: u64,
    pub t1_block: u64,
}

impl ResolvedWindow {
    pub fn key(&self) -> String {
        window_key(self.t0, self.t1)
    }
}

fn iso_7(t: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        t.format("%Y-%m-%dT%H:%M:%S"),
        t.nanosecond() % 1_000_000_000 / 100
    )
}

/// Stable identifier of a window, e.g.
/// `2025-10-10T19:00:00.0000000Z|2025-10-10T22:00:00.0000000Z`.
pub fn window_key(t0: DateTime<Utc>, t1: DateTime<Utc>) -> String {
    format!("{}|{}", iso_7(t0), iso_7(t1))
}

fn parse_utc(field: &str, value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value.trim())
        .map_err(|e| Error::Configuration(format!("analysis_window.{field}: {e}")))?;
    if parsed.offset().local_minus_utc() != 0 {
        return Err(Error::Configuration(format!(
            "analysis_window.{field} must be UTC, got offset {}",
            parsed.offset()
        )));
    }
    Ok(parsed.with_timezone(&Utc))
}

/// Turn window settings into two UTC instants.
///
/// Explicit bounds win, then reference plus offsets, then `now` plus offsets.
pub fn resolve_bounds(cfg: &AnalysisWindow, now: DateTime<Utc>) -> Result<WindowBounds> {
    let offsets = cfg.t0_offset_hours.zip(cfg.t1_offset_hours);

    let (t0, t1) = match (&cfg.start, &cfg.end, &cfg.reference, offsets) {
        (Some(start), Some(end), _, _) => (parse_utc("start", start)?, parse_utc("end", end)?),
        (_, _, Some(reference), Some((o0, o1))) => {
            let r = parse_utc("reference", reference)?;
            (r + Duration::hours(o0), r + Duration::hours(o1))
        }
        (_, _, None, Some((o0, o1))) => (now + Duration::hours(o0), now + Duration::hours(o1)),
        _ => {
            return Err(Error::Configuration(
                "analysis_window needs start+end, reference+offsets, or both offsets".to_string(),
            ))
        }
    };

    if t0 >= t1 {
        return Err(Error::Configuration(format!(
            "analysis_window start {t0} must be before end {t1}"
        )));
    }
    Ok(WindowBounds { t0, t1 })
}

/// How timestamps are mapped onto block heights.
pub enum BlockLocator<'a, E, B> {
    /// Direct explorer lookup, memoized per `(unix, direction)`.
    Explorer { explorer: &'a E, cache: BlockTimeCache },
    /// Binary search over block timestamps.
    Search { blocks: &'a B },
}

impl<E, B> BlockLocator<'_, E, B>
where
    E: BlockExplorer + Sync,
    B: BlockSource + Sync,
{
    pub async fn block_at(&self, unix: i64, direction: BlockDirection) -> Result<u64> {
        match self {
            Self::Explorer { explorer, cache } => {
                if let Some(hit) = cache.get(&(unix, direction)) {
                    return Ok(hit);
                }
                let block = explorer.block_at_time(unix, direction).await?;
                cache.insert((unix, direction), block);
                Ok(block)
            }
            Self::Search { blocks } => search_block(*blocks, unix).await,
        }
    }
}

/// Smallest block whose timestamp is `>= target`. Targets at or past the
/// latest block resolve to the latest block.
pub async fn search_block<B>(blocks: &B, target: i64) -> Result<u64>
where
    B: BlockSource + Sync,
{
    let latest = blocks.latest_block().await?;
    let latest_ts = blocks.block_timestamp(latest).await?;
    if target >= latest_ts {
        return Ok(latest);
    }

    let mut low = 0_u64;
    let mut high = latest;
    let mut best = latest;
    let mut probes = 0;
    while low <= high && probes < MAX_SEARCH_PROBES {
        probes += 1;
        let mid = low + (high - low) / 2;
        let ts = blocks.block_timestamp(mid).await?;
        if ts >= target {
            best = mid;
            if mid == 0 {
                break;
            }
            high = mid - 1;
        } else {
            low = mid + 1;
        }
    }
    tracing::debug!(target, best, probes, "block search finished");
    Ok(best)
}

/// Resolve the configured window to block heights. Block overrides take
/// precedence per side.
pub async fn resolve_window<E, B>(
    cfg: &AnalysisWindow,
    now: DateTime<Utc>,
    locator: &BlockLocator<'_, E, B>,
) -> Result<ResolvedWindow>
where
    E: BlockExplorer + Sync,
    B: BlockSource + Sync,
{
    let bounds = resolve_bounds(cfg, now)?;
    let t0_block = match cfg.t0_block {
        Some(b) => b,
        None => locator.block_at(bounds.t0.timestamp(), BlockDirection::Before).await?,
    };
    let t1_block = match cfg.t1_block {
        Some(b) => b,
        None => locator.block_at(bounds.t1.timestamp(), BlockDirection::After).await?,
    };
    if t0_block > t1_block {
        return Err(Error::Configuration(format!(
            "t0 block {t0_block} is after t1 block {t1_block}"
        )));
    }

    let window = ResolvedWindow {
        t0: bounds.t0,
        t1: bounds.t1,
        t0_block,
        t1_block,
    };
    tracing::info!(window_key = %window.key(), t0_block, t1_block, "analysis window resolved");
    Ok(window)
}
