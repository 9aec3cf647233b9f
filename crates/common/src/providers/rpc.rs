use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::http::{self, RetryPolicy};
use super::{BalanceSource, BlockSource, LogSource, TokenMetadataSource, TransactionSource, TransferSource};
use crate::config::ChainEndpoint;
use crate::error::{Error, Provider, Result};
use crate::types::{
    normalize_address, parse_hex_u128, parse_hex_u64, AssetTransfer, LogFilter, RawLog,
    TokenMetadata, TxInfo,
};

const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const TOKEN0_SELECTOR: &str = "0x0dfe1681";
const TOKEN1_SELECTOR: &str = "0xd21220a7";
const TRANSFER_PAGE_SIZE: &str = "0x3e8";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    from: String,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcTokenMetadata {
    decimals: Option<u32>,
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTokenBalances {
    #[serde(default)]
    token_balances: Vec<RpcTokenBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTokenBalance {
    contract_address: String,
    token_balance: Option<String>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransfersPage {
    #[serde(default)]
    transfers: Vec<RpcTransfer>,
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransfer {
    block_num: String,
    unique_id: Option<String>,
    hash: String,
    from: Option<String>,
    to: Option<String>,
    value: Option<f64>,
    asset: Option<String>,
    category: String,
    raw_contract: Option<RpcRawContract>,
    metadata: Option<RpcTransferMetadata>,
}

#[derive(Debug, Deserialize)]
struct RpcRawContract {
    value: Option<String>,
    address: Option<String>,
    decimal: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransferMetadata {
    block_timestamp: Option<String>,
}

/// JSON-RPC client for an Alchemy-compatible endpoint. Standard `eth_*`
/// calls work against any node; `alchemy_*` calls need the enhanced API.
pub struct AlchemyClient {
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl AlchemyClient {
    pub fn new(endpoint: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(Error::FatalConfig("rpc endpoint is not configured".to_string()));
        }
        Ok(Self {
            http: http::build_client(timeout)?,
            endpoint: endpoint.to_string(),
            retry,
            next_id: AtomicU64::new(1),
        })
    }

    /// Client for one entry of [`Providers::chains`](crate::config::Providers::chains),
    /// sharing the provider-wide timeout and retry settings.
    pub fn for_chain(cfg: &crate::config::Providers, chain: &ChainEndpoint) -> Result<Self> {
        if cfg.alchemy_api_key.is_empty() && chain.rpc_url.contains("alchemy.com") {
            return Err(Error::FatalConfig(format!(
                "ALCHEMY_API_KEY is required for the alchemy endpoint of {}",
                chain.name
            )));
        }
        Self::new(
            &chain.rpc_url,
            Duration::from_secs(cfg.request_timeout_secs),
            RetryPolicy {
                retries: cfg.rpc_max_retries,
                base_delay: Duration::from_millis(cfg.rpc_retry_base_ms),
                factor: 2,
            },
        )
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        method: &str,
        params: Value,
    ) -> Result<T> {
        http::instrumented(
            endpoint,
            http::with_retry(self.retry, || self.rpc_once(method, &params)),
        )
        .await
    }

    async fn rpc_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| http::transport_error(Provider::Alchemy, &e))?;
        let resp = http::check_status(Provider::Alchemy, resp).await?;
        let body: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| Error::transient(Provider::Alchemy, format!("{method}: bad response: {e}")))?;

        if let Some(err) = body.error {
            return Err(classify_rpc_error(method, &err));
        }
        body.result
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("{method}: missing result")))
    }

    async fn eth_call(&self, endpoint: &'static str, to: &str, data: String, block: Option<u64>) -> Result<String> {
        let tag = block.map_or_else(|| "latest".to_string(), hex_block);
        self.rpc(endpoint, "eth_call", json!([{ "to": to, "data": data }, tag]))
            .await
    }

    async fn transfers_page(&self, params: Value) -> Result<RpcTransfersPage> {
        self.rpc("alchemy_getAssetTransfers", "alchemy_getAssetTransfers", json!([params]))
            .await
    }
}

fn hex_block(block: u64) -> String {
    format!("0x{block:x}")
}

fn classify_rpc_error(method: &str, err: &JsonRpcError) -> Error {
    let msg = err.message.to_ascii_lowercase();
    if err.code == 429 || err.code == -32005 || msg.contains("rate limit") || msg.contains("compute units") {
        metrics::counter!("evaluator_rate_limits_total", "provider" => Provider::Alchemy.as_str())
            .increment(1);
        return Error::RateLimited {
            provider: Provider::Alchemy,
            retry_after: Provider::Alchemy.default_retry_after(),
        };
    }
    if http::is_range_message(&msg) {
        return Error::RangeTooLarge {
            provider: Provider::Alchemy,
            message: err.message.clone(),
        };
    }
    Error::transient(
        Provider::Alchemy,
        format!("{method}: rpc error {}: {}", err.code, err.message),
    )
}

fn pad_address(address: &str) -> String {
    let bare = address.trim_start_matches("0x").to_ascii_lowercase();
    format!("{bare:0>64}")
}

/// Last 20 bytes of a 32-byte ABI word, as a lowercase address.
pub fn word_to_address(word: &str) -> Option<String> {
    let bare = word.trim_start_matches("0x");
    if bare.len() < 40 {
        return None;
    }
    Some(format!("0x{}", bare[bare.len() - 40..].to_ascii_lowercase()))
}

fn log_position_from_unique_id(unique_id: Option<&str>) -> u64 {
    unique_id
        .and_then(|id| id.rsplit_once(":log:"))
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

fn convert_transfer(t: RpcTransfer) -> Option<AssetTransfer> {
    let block = parse_hex_u64(&t.block_num)?;
    let (raw_value, token, decimals) = match t.raw_contract {
        Some(rc) => (
            rc.value,
            rc.address.map(|a| normalize_address(&a)),
            rc.decimal.as_deref().and_then(parse_hex_u64).and_then(|d| u32::try_from(d).ok()),
        ),
        None => (None, None, None),
    };
    let timestamp = t
        .metadata
        .and_then(|m| m.block_timestamp)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc));
    Some(AssetTransfer {
        log_position: log_position_from_unique_id(t.unique_id.as_deref()),
        unique_id: t.unique_id,
        hash: t.hash,
        block,
        from: t.from.map(|a| normalize_address(&a)).unwrap_or_default(),
        to: t.to.map(|a| normalize_address(&a)).unwrap_or_default(),
        category: t.category,
        token,
        asset: t.asset,
        value: t.value,
        raw_value,
        decimals,
        timestamp,
    })
}

impl BlockSource for AlchemyClient {
    async fn latest_block(&self) -> Result<u64> {
        let hex: String = self.rpc("eth_blockNumber", "eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("bad block number {hex}")))
    }

    async fn block_timestamp(&self, block: u64) -> Result<i64> {
        let b: Option<RpcBlock> = self
            .rpc("eth_getBlockByNumber", "eth_getBlockByNumber", json!([hex_block(block), false]))
            .await?;
        let b = b.ok_or_else(|| Error::transient(Provider::Alchemy, format!("block {block} not found")))?;
        parse_hex_u64(&b.timestamp)
            .and_then(|t| i64::try_from(t).ok())
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("bad timestamp {}", b.timestamp)))
    }
}

impl BalanceSource for AlchemyClient {
    async fn eth_balance(&self, address: &str, block: u64) -> Result<u128> {
        let hex: String = self
            .rpc("eth_getBalance", "eth_getBalance", json!([address, hex_block(block)]))
            .await?;
        parse_hex_u128(&hex)
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("balance out of range: {hex}")))
    }

    async fn token_balance(&self, address: &str, token: &str, block: u64) -> Result<u128> {
        let data = format!("{BALANCE_OF_SELECTOR}{}", pad_address(address));
        let hex = self.eth_call("eth_call_balance_of", token, data, Some(block)).await?;
        parse_hex_u128(&hex)
            .ok_or_else(|| Error::transient(Provider::Alchemy, format!("token balance out of range: {hex}")))
    }

    async fn held_tokens(&self, address: &str) -> Result<Vec<String>> {
        let page: RpcTokenBalances = self
            .rpc("alchemy_getTokenBalances", "alchemy_getTokenBalances", json!([address, "erc20"]))
            .await?;
        Ok(page
            .token_balances
            .into_iter()
            .filter(|b| b.error.is_none())
            .filter(|b| b.token_balance.as_deref().and_then(parse_hex_u128).unwrap_or(0) > 0)
            .map(|b| normalize_address(&b.contract_address))
            .collect())
    }
}

impl TokenMetadataSource for AlchemyClient {
    async fn token_metadata(&self, token: &str) -> Result<TokenMetadata> {
        let meta: RpcTokenMetadata = self
            .rpc("alchemy_getTokenMetadata", "alchemy_getTokenMetadata", json!([token]))
            .await?;
        let defaults = TokenMetadata::default();
        Ok(TokenMetadata {
            decimals: meta.decimals.unwrap_or(defaults.decimals),
            symbol: meta.symbol.filter(|s| !s.is_empty()).unwrap_or(defaults.symbol),
        })
    }
}

impl TransferSource for AlchemyClient {
    async fn asset_transfers(&self, address: &str, from_block: u64, to_block: u64) -> Result<Vec<AssetTransfer>> {
        let mut out = Vec::new();
        for direction in ["fromAddress", "toAddress"] {
            let mut page_key: Option<String> = None;
            loop {
                let mut params = json!({
                    "fromBlock": hex_block(from_block),
                    "toBlock": hex_block(to_block),
                    "category": ["external", "erc20"],
                    "excludeZeroValue": true,
                    "withMetadata": true,
                    "maxCount": TRANSFER_PAGE_SIZE,
                });
                params[direction] = json!(address);
                if let Some(key) = &page_key {
                    params["pageKey"] = json!(key);
                }
                let page = self.transfers_page(params).await?;
                out.extend(page.transfers.into_iter().filter_map(convert_transfer));
                match page.page_key {
                    Some(key) if !key.is_empty() => page_key = Some(key),
                    _ => break,
                }
            }
        }
        Ok(out)
    }
}

impl LogSource for AlchemyClient {
    async fn logs_in_range(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let mut params = json!({
            "fromBlock": hex_block(filter.from_block),
            "toBlock": hex_block(filter.to_block),
            "topics": filter.topics,
        });
        if let Some(address) = &filter.address {
            params["address"] = json!(address);
        }
        let logs: Vec<RpcLog> = self.rpc("eth_getLogs", "eth_getLogs", json!([params])).await?;
        Ok(logs
            .into_iter()
            .filter(|l| !l.removed)
            .filter_map(|l| {
                Some(RawLog {
                    address: normalize_address(&l.address),
                    topics: l.topics,
                    data: l.data,
                    block_number: parse_hex_u64(l.block_number.as_deref()?)?,
                    tx_hash: l.transaction_hash?,
                    log_index: parse_hex_u64(l.log_index.as_deref()?)?,
                })
            })
            .collect())
    }
}

impl TransactionSource for AlchemyClient {
    async fn transaction(&self, hash: &str) -> Result<TxInfo> {
        let tx: Option<RpcTransaction> = self
            .rpc("eth_getTransactionByHash", "eth_getTransactionByHash", json!([hash]))
            .await?;
        let tx = tx.ok_or_else(|| Error::transient(Provider::Alchemy, format!("transaction {hash} not found")))?;
        Ok(TxInfo {
            from: normalize_address(&tx.from),
            to: tx.to.map(|t| normalize_address(&t)),
        })
    }

    async fn pool_tokens(&self, pool: &str) -> Result<(String, String)> {
        let t0 = self.eth_call("eth_call_token0", pool, TOKEN0_SELECTOR.to_string(), None).await?;
        let t1 = self.eth_call("eth_call_token1", pool, TOKEN1_SELECTOR.to_string(), None).await?;
        match (word_to_address(&t0), word_to_address(&t1)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::transient(Provider::Alchemy, format!("pool {pool} returned no tokens"))),
        }
    }
}
