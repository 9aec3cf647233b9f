use common::config::ScoringWeights;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::mining::Candidate;
use crate::pnl::PnlSummary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub t1_pnl: f64,
    pub t7_pnl: f64,
    pub win_rate: f64,
    pub trade_ratio: f64,
    pub impact: f64,
    pub repeatability: f64,
    pub liquidity: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            t1_pnl: 0.30,
            t7_pnl: 0.20,
            win_rate: 0.10,
            trade_ratio: 0.15,
            impact: 0.10,
            repeatability: 0.10,
            liquidity: 0.05,
        }
    }
}

impl Weights {
    fn total(&self) -> f64 {
        self.t1_pnl
            + self.t7_pnl
            + self.win_rate
            + self.trade_ratio
            + self.impact
            + self.repeatability
            + self.liquidity
    }

    /// Overrides layered over the defaults, rescaled to sum to 1. A zero
    /// total falls back to the defaults.
    pub fn merged(overrides: &ScoringWeights) -> Self {
        let d = Self::default();
        let merged = Self {
            t1_pnl: overrides.t1_pnl.unwrap_or(d.t1_pnl),
            t7_pnl: overrides.t7_pnl.unwrap_or(d.t7_pnl),
            win_rate: overrides.win_rate.unwrap_or(d.win_rate),
            trade_ratio: overrides.trade_ratio.unwrap_or(d.trade_ratio),
            impact: overrides.impact.unwrap_or(d.impact),
            repeatability: overrides.repeatability.unwrap_or(d.repeatability),
            liquidity: overrides.liquidity.unwrap_or(d.liquidity),
        };
        let total = merged.total();
        if !total.is_finite() || total <= 0.0 {
            return d;
        }
        Self {
            t1_pnl: merged.t1_pnl / total,
            t7_pnl: merged.t7_pnl / total,
            win_rate: merged.win_rate / total,
            trade_ratio: merged.trade_ratio / total,
            impact: merged.impact / total,
            repeatability: merged.repeatability / total,
            liquidity: merged.liquidity / total,
        }
    }
}

fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

/// Realized PnL, saturating at $50k.
pub fn t1_pnl_score(realized: f64) -> f64 {
    clamp01(realized / 50_000.0)
}

/// Combined net flow over both windows, saturating at $100k.
pub fn t7_pnl_score(w1_net: f64, w2_net: f64) -> f64 {
    clamp01((w1_net + w2_net) / 100_000.0)
}

pub fn win_rate_score(realized_tokens: u64, trades: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    clamp01(realized_tokens as f64 / trades.max(1) as f64)
}

/// Share of swaps that happened in the second window.
pub fn trade_ratio_score(w1_swaps: u64, w2_swaps: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    clamp01(w2_swaps as f64 / (w1_swaps + w2_swaps).max(1) as f64)
}

/// Higher for smaller total volume; zero at $2M.
pub fn impact_score(total_volume: f64) -> f64 {
    clamp01(1.0 - total_volume / 2_000_000.0)
}

pub fn repeatability_score(chains: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    clamp01(chains as f64 / 4.0)
}

pub fn liquidity_score(total_volume: f64) -> f64 {
    clamp01(total_volume / 1_000_000.0)
}

/// Normalized components, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Components {
    pub t1_pnl: f64,
    pub t7_pnl: f64,
    pub win_rate: f64,
    pub trade_ratio: f64,
    pub impact: f64,
    pub repeatability: f64,
    pub liquidity: f64,
}

impl Components {
    pub fn of(candidate: &Candidate, pnl: &PnlSummary) -> Self {
        let total_volume = candidate.w1_volume + candidate.w2_volume;
        Self {
            t1_pnl: t1_pnl_score(pnl.realized.to_f64().unwrap_or(0.0)),
            t7_pnl: t7_pnl_score(candidate.w1_net, candidate.w2_net),
            win_rate: win_rate_score(pnl.realized_tokens, pnl.trades),
            trade_ratio: trade_ratio_score(candidate.w1_swaps, candidate.w2_swaps),
            impact: impact_score(total_volume),
            repeatability: repeatability_score(candidate.chains.len()),
            liquidity: liquidity_score(total_volume),
        }
    }

    pub fn weighted(&self, w: &Weights) -> f64 {
        self.t1_pnl * w.t1_pnl
            + self.t7_pnl * w.t7_pnl
            + self.win_rate * w.win_rate
            + self.trade_ratio * w.trade_ratio
            + self.impact * w.impact
            + self.repeatability * w.repeatability
            + self.liquidity * w.liquidity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredWallet {
    pub wallet: String,
    pub score: f64,
    pub components: Components,
    pub pnl: PnlSummary,
}

/// Score and rank candidates, best first. Equal scores keep input order.
/// Candidates without a PnL entry score with an empty summary.
pub fn score(candidates: &[Candidate], pnl: &[(String, PnlSummary)], overrides: &ScoringWeights) -> Vec<ScoredWallet> {
    let weights = Weights::merged(overrides);
    let mut out: Vec<ScoredWallet> = candidates
        .iter()
        .map(|c| {
            let summary = pnl
                .iter()
                .find(|(w, _)| w.eq_ignore_ascii_case(&c.wallet))
                .map(|(_, s)| *s)
                .unwrap_or_default();
            let components = Components::of(c, &summary);
            ScoredWallet {
                wallet: c.wallet.clone(),
                score: components.weighted(&weights),
                components,
                pnl: summary,
            }
        })
        .collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candidate(wallet: &str, w1_net: f64, w2_net: f64, volume: f64) -> Candidate {
        Candidate {
            wallet: wallet.to_string(),
            w1_net,
            w1_volume: volume / 2.0,
            w1_swaps: 3,
            w2_net,
            w2_volume: volume / 2.0,
            w2_swaps: 1,
            chains: vec![1, 42_161],
        }
    }

    fn pnl(realized: i64, trades: u64, realized_tokens: u64) -> PnlSummary {
        PnlSummary {
            realized: Decimal::from(realized),
            gross: Decimal::ZERO,
            trades,
            realized_tokens,
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = Weights::merged(&ScoringWeights::default());
        assert!((w.total() - 1.0).abs() < 1e-12);
        assert_eq!(w, Weights::default());
    }

    #[test]
    fn test_single_nonzero_weight_equals_component() {
        let overrides = ScoringWeights {
            t1_pnl: Some(1.0),
            t7_pnl: Some(0.0),
            win_rate: Some(0.0),
            trade_ratio: Some(0.0),
            impact: Some(0.0),
            repeatability: Some(0.0),
            liquidity: Some(0.0),
        };
        let c = candidate("0xa", 40_000.0, 50_000.0, 300_000.0);
        let scored = score(&[c], &[("0xA".to_string(), pnl(20_000, 4, 1))], &overrides);
        assert_eq!(scored[0].score, scored[0].components.t1_pnl);
        assert!((scored[0].score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_partial_override_is_rescaled() {
        let overrides = ScoringWeights {
            t1_pnl: Some(1.3),
            ..ScoringWeights::default()
        };
        let w = Weights::merged(&overrides);
        assert!((w.total() - 1.0).abs() < 1e-12);
        assert!((w.t1_pnl - 0.65).abs() < 1e-12);
    }

    #[test]
    fn test_zero_total_reverts_to_defaults() {
        let zero = ScoringWeights {
            t1_pnl: Some(0.0),
            t7_pnl: Some(0.0),
            win_rate: Some(0.0),
            trade_ratio: Some(0.0),
            impact: Some(0.0),
            repeatability: Some(0.0),
            liquidity: Some(0.0),
        };
        assert_eq!(Weights::merged(&zero), Weights::default());
    }

    #[test]
    fn test_normalizations_clamp() {
        assert_eq!(t1_pnl_score(-5.0), 0.0);
        assert_eq!(t1_pnl_score(80_000.0), 1.0);
        assert_eq!(win_rate_score(3, 0), 1.0);
        assert_eq!(trade_ratio_score(0, 0), 0.0);
        assert_eq!(impact_score(500_000.0), 0.75);
        assert_eq!(impact_score(5_000_000.0), 0.0);
        assert_eq!(repeatability_score(6), 1.0);
        assert_eq!(liquidity_score(250_000.0), 0.25);
    }

    #[test]
    fn test_ranking_is_descending_and_stable() {
        let candidates = [
            candidate("0x1", 10_000.0, 10_000.0, 100_000.0),
            candidate("0x2", 90_000.0, 90_000.0, 100_000.0),
            candidate("0x3", 10_000.0, 10_000.0, 100_000.0),
        ];
        let scored = score(&candidates, &[], &ScoringWeights::default());
        let order: Vec<_> = scored.iter().map(|s| s.wallet.as_str()).collect();
        assert_eq!(order, vec!["0x2", "0x1", "0x3"]);
        assert_eq!(scored[1].score, scored[2].score);
    }
}
