use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Lowercases an address so lookups and uniqueness are case-insensitive.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

pub fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Parses a `0x`-prefixed hex quantity. Values wider than 128 bits are rejected.
pub fn parse_hex_u128(s: &str) -> Option<u128> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() {
        return Some(0);
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Some(0);
    }
    if digits.len() > 32 {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    parse_hex_u128(s).and_then(|v| u64::try_from(v).ok())
}

/// Converts an integer token amount into whole units.
#[allow(clippy::cast_precision_loss)]
pub fn scale_amount(raw: u128, decimals: u32) -> f64 {
    raw as f64 / 10f64.powi(i32::try_from(decimals).unwrap_or(18))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockDirection {
    Before,
    After,
}

impl BlockDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub decimals: u32,
    pub symbol: String,
}

impl Default for TokenMetadata {
    fn default() -> Self {
        Self {
            decimals: 18,
            symbol: "UNKNOWN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub from: String,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Option<String>,
    /// Topic positions; `None` matches anything.
    pub topics: Vec<Option<String>>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    pub fn event(topic0: &str) -> Self {
        Self {
            topics: vec![Some(topic0.to_string())],
            ..Self::default()
        }
    }

    pub fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// Transfer as reported by the asset-transfer API, before amount resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetTransfer {
    pub unique_id: Option<String>,
    pub hash: String,
    pub block: u64,
    pub log_position: u64,
    pub from: String,
    pub to: String,
    pub category: String,
    /// Contract address; `None` for native ETH.
    pub token: Option<String>,
    pub asset: Option<String>,
    /// Decimal amount in whole units.
    pub value: Option<f64>,
    /// Hex integer amount in base units.
    pub raw_value: Option<String>,
    pub decimals: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Transfer,
    Swap,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Swap => "swap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(Self::Transfer),
            "swap" => Some(Self::Swap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dex {
    UniV2,
    UniV3,
}

impl Dex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniV2 => "univ2",
            Self::UniV3 => "univ3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "univ2" => Some(Self::UniV2),
            "univ3" => Some(Self::UniV3),
            _ => None,
        }
    }
}

/// A decoded transfer or swap; unique on `(chain_id, tx_hash, log_position)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub chain_id: i64,
    pub tx_hash: String,
    pub log_position: u64,
    pub block: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub dex: Option<Dex>,
    /// Trader for swaps, sender for transfers.
    pub counterparty_from: String,
    /// Recipient for transfers, router for swaps.
    pub counterparty_to: Option<String>,
    pub pool: Option<String>,
    pub asset_in: String,
    pub amount_in_raw: u128,
    pub asset_out: String,
    pub amount_out_raw: u128,
    pub via_aggregator: bool,
    pub usd_in: Option<f64>,
    pub usd_out: Option<f64>,
    pub usd_notional: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateWallet {
    pub id: i64,
    pub address: String,
    pub detected_at_block: u64,
    pub first_transfer_amount: f64,
    pub first_transfer_token: Option<String>,
    pub first_transfer_decimals: Option<u32>,
    pub analyzed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCandidate {
    pub address: String,
    pub detected_at_block: u64,
    pub first_transfer_amount: f64,
    pub first_transfer_token: Option<String>,
    pub first_transfer_decimals: Option<u32>,
}

/// Persisted result of valuing one wallet over one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletAnalysis {
    pub wallet_id: i64,
    pub t0_block: u64,
    pub t1_block: u64,
    pub t0_timestamp: DateTime<Utc>,
    pub t1_timestamp: DateTime<Utc>,
    pub value_t0_usd: f64,
    pub value_t1_usd: f64,
    pub simple_return: Option<f64>,
    pub net_cash_flow_usd: f64,
    pub adjusted_return: Option<f64>,
    pub funding_heavy: bool,
    pub stable_heavy: bool,
    pub price_missing: bool,
    pub token_count: u32,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantities() {
        assert_eq!(parse_hex_u128("0x0"), Some(0));
        assert_eq!(parse_hex_u128("0x"), Some(0));
        assert_eq!(parse_hex_u128("0x1bc16d674ec80000"), Some(2_000_000_000_000_000_000));
        assert_eq!(parse_hex_u64("0x10"), Some(16));
        // 32-byte word padded with zeros still fits.
        let padded = format!("0x{}{}", "0".repeat(48), "de0b6b3a7640000");
        assert_eq!(parse_hex_u128(&padded), Some(1_000_000_000_000_000_000));
        assert_eq!(parse_hex_u128(&format!("0x1{}", "0".repeat(32))), None);
        assert_eq!(parse_hex_u128("0xzz"), None);
    }

    #[test]
    fn test_scale_amount() {
        assert!((scale_amount(1_500_000, 6) - 1.5).abs() < 1e-12);
        assert!((scale_amount(2_000_000_000_000_000_000, 18) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_address_helpers_are_case_insensitive() {
        assert_eq!(normalize_address(" 0xAbC "), "0xabc");
        assert!(same_address("0xABC", "0xabc"));
        assert!(!same_address("0xabc", "0xabd"));
    }
}
