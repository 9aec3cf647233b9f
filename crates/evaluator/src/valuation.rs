//! USD valuation of a wallet at the two window blocks.
//!
//! Each wallet is valued into a fresh [`WalletValuation`]; nothing is shared
//! between wallets except the read-mostly metadata cache.

use std::collections::BTreeSet;

use common::config;
use common::error::{Error, Result};
use common::providers::{
    token_balance_or_zero, token_metadata_cached, BalanceSource, MetadataCache, PriceSource, TokenMetadataSource,
    TransferSource,
};
use common::types::{normalize_address, same_address, scale_amount, CandidateWallet, WalletAnalysis};

use crate::collector::{collect_wallet_transfers, WalletTransfer};
use crate::pricing::{price_or_missing, StableSet};
use crate::window::ResolvedWindow;

#[derive(Debug, Clone)]
pub struct ValuationSettings {
    pub max_tokens: usize,
    pub stable_heavy_threshold: f64,
    pub funding_heavy_threshold: f64,
    pub weth_address: String,
}

impl From<&config::Valuation> for ValuationSettings {
    fn from(cfg: &config::Valuation) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            stable_heavy_threshold: cfg.stable_heavy_threshold,
            funding_heavy_threshold: cfg.funding_heavy_threshold,
            weth_address: normalize_address(&cfg.weth_address),
        }
    }
}

impl Default for ValuationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            stable_heavy_threshold: 0.9,
            funding_heavy_threshold: 0.5,
            weth_address: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletValuation {
    pub value_t0: f64,
    pub value_t1: f64,
    pub stable_t0: f64,
    pub net_cash_flow: f64,
    pub simple_return: Option<f64>,
    pub adjusted_return: Option<f64>,
    pub stable_heavy: bool,
    pub funding_heavy: bool,
    pub missing_prices: Vec<String>,
    pub truncated_tokens: usize,
    pub token_count: u32,
    pub notes: Option<String>,
}

impl WalletValuation {
    pub fn into_analysis(self, wallet_id: i64, window: &ResolvedWindow) -> WalletAnalysis {
        WalletAnalysis {
            wallet_id,
            t0_block: window.t0_block,
            t1_block: window.t1_block,
            t0_timestamp: window.t0,
            t1_timestamp: window.t1,
            value_t0_usd: self.value_t0,
            value_t1_usd: self.value_t1,
            simple_return: self.simple_return,
            net_cash_flow_usd: self.net_cash_flow,
            adjusted_return: self.adjusted_return,
            funding_heavy: self.funding_heavy,
            stable_heavy: self.stable_heavy,
            price_missing: !self.missing_prices.is_empty(),
            token_count: self.token_count,
            notes: self.notes,
        }
    }
}

/// `(simple, adjusted)`. Both are `None` without a starting value.
pub fn returns(value_t0: f64, value_t1: f64, net_cash_flow: f64) -> (Option<f64>, Option<f64>) {
    if value_t0 <= 0.0 {
        return (None, None);
    }
    let simple = (value_t1 - value_t0) / value_t0;
    let adjusted = (value_t1 - value_t0 - net_cash_flow) / value_t0;
    (Some(simple), Some(adjusted))
}

/// `(stable_heavy, funding_heavy)`. Thresholds are inclusive.
pub fn composition_flags(
    value_t0: f64,
    stable_t0: f64,
    net_cash_flow: f64,
    settings: &ValuationSettings,
) -> (bool, bool) {
    if value_t0 <= 0.0 {
        return (false, false);
    }
    (
        stable_t0 / value_t0 >= settings.stable_heavy_threshold,
        net_cash_flow.abs() / value_t0 >= settings.funding_heavy_threshold,
    )
}

fn build_notes(truncated: usize, missing: &[String], net_cash_flow: f64) -> Option<String> {
    let mut parts = Vec::new();
    if truncated > 0 {
        parts.push(format!("TruncatedTokens={truncated}"));
    }
    if !missing.is_empty() {
        parts.push(format!("MissingPrices={}", missing.join(";")));
    }
    if net_cash_flow != 0.0 {
        parts.push(format!("NetCF={net_cash_flow:.2}"));
    }
    (!parts.is_empty()).then(|| parts.join(" | "))
}

struct TokenValue {
    t0: f64,
    t1: f64,
    stable: bool,
    priced: bool,
}

pub struct Valuer<'a, C, P> {
    chain: &'a C,
    prices: &'a P,
    meta_cache: MetadataCache,
    stables: StableSet,
    settings: ValuationSettings,
}

impl<'a, C, P> Valuer<'a, C, P>
where
    C: BalanceSource + TokenMetadataSource + TransferSource + Sync,
    P: PriceSource + Sync,
{
    pub fn new(
        chain: &'a C,
        prices: &'a P,
        meta_cache: MetadataCache,
        stables: StableSet,
        settings: ValuationSettings,
    ) -> Self {
        Self {
            chain,
            prices,
            meta_cache,
            stables,
            settings,
        }
    }

    async fn price_or_missing(&self, token: &str, unix: i64) -> Result<Option<f64>> {
        price_or_missing(self.prices, &self.stables, token, None, unix).await
    }

    /// `None` when the wallet held none of `token` at either block.
    async fn value_token(
        &self,
        wallet: &CandidateWallet,
        token: &str,
        window: &ResolvedWindow,
    ) -> Result<Option<TokenValue>> {
        let meta = token_metadata_cached(self.chain, &self.meta_cache, token).await?;
        let first_transfer_decimals = wallet
            .first_transfer_token
            .as_deref()
            .filter(|t| same_address(t, token))
            .and(wallet.first_transfer_decimals);
        let decimals = meta
            .as_ref()
            .map(|m| m.decimals)
            .filter(|d| *d > 0)
            .or(first_transfer_decimals)
            .unwrap_or(18);

        let raw_t0 = token_balance_or_zero(self.chain, &wallet.address, token, window.t0_block).await?;
        let raw_t1 = token_balance_or_zero(self.chain, &wallet.address, token, window.t1_block).await?;
        if raw_t0 == 0 && raw_t1 == 0 {
            return Ok(None);
        }

        let stable = self.stables.is_stable(token, meta.as_ref().map(|m| m.symbol.as_str()));
        let (p0, p1) = if stable {
            (Some(1.0), Some(1.0))
        } else {
            (
                self.price_or_missing(token, window.t0.timestamp()).await?,
                self.price_or_missing(token, window.t1.timestamp()).await?,
            )
        };
        Ok(Some(TokenValue {
            t0: scale_amount(raw_t0, decimals) * p0.unwrap_or(0.0),
            t1: scale_amount(raw_t1, decimals) * p1.unwrap_or(0.0),
            stable,
            priced: p0.is_some() && p1.is_some(),
        }))
    }

    /// Signed USD flow of every transfer between the window blocks. Failures
    /// other than rate limits count as zero flow.
    async fn net_cash_flow(&self, wallet: &CandidateWallet, window: &ResolvedWindow) -> Result<f64> {
        let transfers = match collect_wallet_transfers(self.chain, &wallet.address, window.t0_block, window.t1_block).await
        {
            Ok(t) => t,
            Err(e @ Error::RateLimited { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(wallet = %wallet.address, error = %e, "cash flow unavailable; using 0");
                return Ok(0.0);
            }
        };
        let mut net = 0.0;
        for t in &transfers {
            net += self.transfer_flow(&wallet.address, t, window).await?;
        }
        Ok(net)
    }

    async fn transfer_flow(&self, wallet: &str, t: &WalletTransfer, window: &ResolvedWindow) -> Result<f64> {
        let unix = t.timestamp.unwrap_or(window.t1).timestamp();
        let token = t.token.as_deref().unwrap_or(&self.settings.weth_address);
        let Some(price) = self.price_or_missing(token, unix).await? else {
            return Ok(0.0);
        };
        let usd = t.amount * price;
        if same_address(&t.to, wallet) {
            Ok(usd)
        } else if same_address(&t.from, wallet) {
            Ok(-usd)
        } else {
            Ok(0.0)
        }
    }

    pub async fn value_wallet(&self, wallet: &CandidateWallet, window: &ResolvedWindow) -> Result<WalletValuation> {
        let wei_t0 = self.chain.eth_balance(&wallet.address, window.t0_block).await?;
        let wei_t1 = self.chain.eth_balance(&wallet.address, window.t1_block).await?;

        let mut missing = BTreeSet::new();
        let weth = self.settings.weth_address.clone();
        let eth_p0 = self.price_or_missing(&weth, window.t0.timestamp()).await?;
        let eth_p1 = self.price_or_missing(&weth, window.t1.timestamp()).await?;
        if (wei_t0 > 0 || wei_t1 > 0) && (eth_p0.is_none() || eth_p1.is_none()) {
            missing.insert("ETH".to_string());
        }
        let mut value_t0 = scale_amount(wei_t0, 18) * eth_p0.unwrap_or(0.0);
        let mut value_t1 = scale_amount(wei_t1, 18) * eth_p1.unwrap_or(0.0);
        let mut stable_t0 = 0.0;

        let held = self.chain.held_tokens(&wallet.address).await?;
        let truncated = held.len().saturating_sub(self.settings.max_tokens);
        let tokens = &held[..held.len().min(self.settings.max_tokens)];
        if truncated > 0 {
            tracing::info!(wallet = %wallet.address, held = held.len(), truncated, "token list truncated");
        }

        for token in tokens {
            match self.value_token(wallet, token, window).await {
                Ok(Some(v)) => {
                    value_t0 += v.t0;
                    value_t1 += v.t1;
                    if v.stable {
                        stable_t0 += v.t0;
                    }
                    if !v.priced {
                        missing.insert(normalize_address(token));
                    }
                }
                Ok(None) => {}
                Err(e @ Error::RateLimited { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(wallet = %wallet.address, token, error = %e, "token valuation failed");
                    missing.insert(normalize_address(token));
                }
            }
        }

        let net_cash_flow = self.net_cash_flow(wallet, window).await?;
        let (simple_return, adjusted_return) = returns(value_t0, value_t1, net_cash_flow);
        let (stable_heavy, funding_heavy) = composition_flags(value_t0, stable_t0, net_cash_flow, &self.settings);
        let missing_prices: Vec<String> = missing.into_iter().collect();
        let notes = build_notes(truncated, &missing_prices, net_cash_flow);

        tracing::info!(
            wallet = %wallet.address,
            value_t0,
            value_t1,
            simple_return,
            net_cash_flow,
            "wallet valued"
        );
        Ok(WalletValuation {
            value_t0,
            value_t1,
            stable_t0,
            net_cash_flow,
            simple_return,
            adjusted_return,
            stable_heavy,
            funding_heavy,
            missing_prices,
            truncated_tokens: truncated,
            token_count: u32::try_from(tokens.len() + 1).unwrap_or(u32::MAX),
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::tests::{FixedPrices, PEPE, USDC, WETH};
    use chrono::{TimeZone, Utc};
    use common::error::Provider;
    use common::types::{AssetTransfer, TokenMetadata};
    use std::collections::HashMap;
    use std::time::Duration;

    const WALLET: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";
    const ETH: u128 = 1_000_000_000_000_000_000;

    #[derive(Default)]
    struct FakeChain {
        eth: (u128, u128),
        /// token -> (t0 balance, t1 balance)
        tokens: HashMap<String, (u128, u128)>,
        held: Vec<String>,
        meta: HashMap<String, TokenMetadata>,
        transfers: Vec<AssetTransfer>,
        rate_limit_balances: bool,
    }

    impl BalanceSource for FakeChain {
        async fn eth_balance(&self, _address: &str, block: u64) -> Result<u128> {
            Ok(if block == 100 { self.eth.0 } else { self.eth.1 })
        }

        async fn token_balance(&self, _address: &str, token: &str, block: u64) -> Result<u128> {
            if self.rate_limit_balances {
                return Err(Error::RateLimited {
                    provider: Provider::Alchemy,
                    retry_after: Duration::from_secs(60),
                });
            }
            let (b0, b1) = self
                .tokens
                .get(token)
                .copied()
                .ok_or_else(|| Error::transient(Provider::Alchemy, "execution reverted"))?;
            Ok(if block == 100 { b0 } else { b1 })
        }

        async fn held_tokens(&self, _address: &str) -> Result<Vec<String>> {
            Ok(self.held.clone())
        }
    }

    impl TokenMetadataSource for FakeChain {
        async fn token_metadata(&self, token: &str) -> Result<TokenMetadata> {
            self.meta
                .get(token)
                .cloned()
                .ok_or_else(|| Error::transient(Provider::Alchemy, "no metadata"))
        }
    }

    impl TransferSource for FakeChain {
        async fn asset_transfers(&self, _address: &str, _from: u64, _to: u64) -> Result<Vec<AssetTransfer>> {
            Ok(self.transfers.clone())
        }
    }

    fn window() -> ResolvedWindow {
        ResolvedWindow {
            t0: Utc.with_ymd_and_hms(2025, 10, 10, 19, 0, 0).unwrap(),
            t1: Utc.with_ymd_and_hms(2025, 10, 10, 22, 0, 0).unwrap(),
            t0_block: 100,
            t1_block: 200,
        }
    }

    fn wallet() -> CandidateWallet {
        CandidateWallet {
            id: 7,
            address: WALLET.to_string(),
            detected_at_block: 50,
            first_transfer_amount: 1.0,
            first_transfer_token: None,
            first_transfer_decimals: None,
            analyzed: false,
        }
    }

    fn eth_transfer(from: &str, to: &str, amount: f64) -> AssetTransfer {
        AssetTransfer {
            unique_id: None,
            hash: format!("0x{from}{to}"),
            block: 150,
            log_position: 0,
            from: from.to_string(),
            to: to.to_string(),
            category: "external".to_string(),
            token: None,
            asset: Some("ETH".to_string()),
            value: Some(amount),
            raw_value: None,
            decimals: Some(18),
            timestamp: None,
        }
    }

    fn prices() -> FixedPrices {
        FixedPrices(HashMap::from([(WETH.to_string(), 2_000.0)]))
    }

    fn valuer<'a>(chain: &'a FakeChain, prices: &'a FixedPrices) -> Valuer<'a, FakeChain, FixedPrices> {
        Valuer::new(
            chain,
            prices,
            MetadataCache::default(),
            StableSet::new([USDC]),
            ValuationSettings::default(),
        )
    }

    #[test]
    fn test_zero_start_value_has_no_returns() {
        assert_eq!(returns(0.0, 500.0, 100.0), (None, None));
        let (simple, adjusted) = returns(1_000.0, 1_500.0, 200.0);
        assert!((simple.unwrap() - 0.5).abs() < 1e-12);
        assert!((adjusted.unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_funding_heavy_boundary_is_inclusive() {
        let s = ValuationSettings::default();
        assert_eq!(composition_flags(100.0, 0.0, 50.0, &s), (false, true));
        assert_eq!(composition_flags(100.0, 0.0, -50.0, &s), (false, true));
        assert_eq!(composition_flags(100.0, 0.0, 49.99, &s), (false, false));
        assert_eq!(composition_flags(100.0, 90.0, 0.0, &s), (true, false));
        assert_eq!(composition_flags(0.0, 0.0, 50.0, &s), (false, false));
    }

    #[test]
    fn test_notes_format() {
        let notes = build_notes(3, &["0xabc".to_string(), "0xdef".to_string()], -1234.567);
        assert_eq!(
            notes.as_deref(),
            Some("TruncatedTokens=3 | MissingPrices=0xabc;0xdef | NetCF=-1234.57")
        );
        assert_eq!(build_notes(0, &[], 0.0), None);
    }

    #[tokio::test]
    async fn test_value_wallet_sums_eth_and_tokens() {
        let chain = FakeChain {
            eth: (ETH, 2 * ETH),
            tokens: HashMap::from([
                (USDC.to_string(), (1_000_000_000, 500_000_000)),
                (PEPE.to_string(), (5, 5)),
            ]),
            held: vec![USDC.to_string(), PEPE.to_string()],
            meta: HashMap::from([(
                USDC.to_string(),
                TokenMetadata {
                    decimals: 6,
                    symbol: "USDC".to_string(),
                },
            )]),
            transfers: vec![eth_transfer(OTHER, WALLET, 0.5), eth_transfer(WALLET, OTHER, 0.25)],
            ..FakeChain::default()
        };
        let prices = prices();
        let v = valuer(&chain, &prices).value_wallet(&wallet(), &window()).await.unwrap();

        assert!((v.value_t0 - 3_000.0).abs() < 1e-6);
        assert!((v.value_t1 - 4_500.0).abs() < 1e-6);
        assert!((v.stable_t0 - 1_000.0).abs() < 1e-6);
        assert!((v.net_cash_flow - 500.0).abs() < 1e-6);
        assert!((v.simple_return.unwrap() - 0.5).abs() < 1e-9);
        assert!((v.adjusted_return.unwrap() - 1_000.0 / 3_000.0).abs() < 1e-9);
        assert_eq!(v.missing_prices, vec![PEPE.to_string()]);
        assert_eq!(v.token_count, 3);
        assert!(!v.stable_heavy);
        assert!(!v.funding_heavy);

        let analysis = v.into_analysis(7, &window());
        assert!(analysis.price_missing);
        assert_eq!(analysis.t1_block, 200);
    }

    #[tokio::test]
    async fn test_truncation_is_noted_and_zero_balances_skipped() {
        let held: Vec<String> = (0..12).map(|i| format!("0x{i:040x}")).collect();
        let chain = FakeChain {
            tokens: held.iter().map(|t| (t.clone(), (0, 0))).collect(),
            held,
            ..FakeChain::default()
        };
        let prices = prices();
        let v = valuer(&chain, &prices).value_wallet(&wallet(), &window()).await.unwrap();
        assert_eq!(v.truncated_tokens, 2);
        assert_eq!(v.token_count, 11);
        assert!(v.missing_prices.is_empty());
        assert_eq!(v.simple_return, None);
        assert_eq!(v.adjusted_return, None);
        assert_eq!(v.notes.as_deref(), Some("TruncatedTokens=2"));
    }

    #[tokio::test]
    async fn test_first_transfer_decimals_used_when_metadata_missing() {
        let token = "0x00000000000000000000000000000000000000d6";
        let chain = FakeChain {
            tokens: HashMap::from([(token.to_string(), (2_000_000, 2_000_000))]),
            held: vec![token.to_string()],
            ..FakeChain::default()
        };
        let prices = FixedPrices(HashMap::from([(token.to_string(), 10.0)]));
        let mut w = wallet();
        w.first_transfer_token = Some(token.to_uppercase().replace("0X", "0x"));
        w.first_transfer_decimals = Some(6);
        let v = valuer(&chain, &prices).value_wallet(&w, &window()).await.unwrap();
        assert!((v.value_t0 - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_token_rate_limit_aborts_wallet() {
        let chain = FakeChain {
            held: vec![PEPE.to_string()],
            rate_limit_balances: true,
            ..FakeChain::default()
        };
        let prices = prices();
        let err = valuer(&chain, &prices).value_wallet(&wallet(), &window()).await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_unreadable_token_balance_degrades_to_zero() {
        let chain = FakeChain {
            eth: (ETH, ETH),
            held: vec![PEPE.to_string()],
            ..FakeChain::default()
        };
        let prices = prices();
        let v = valuer(&chain, &prices).value_wallet(&wallet(), &window()).await.unwrap();
        assert!((v.value_t0 - 2_000.0).abs() < 1e-9);
        assert_eq!(v.simple_return, Some(0.0));
        assert!(v.missing_prices.is_empty());
    }
}
