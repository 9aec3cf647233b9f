use std::time::Duration;

use serde::Deserialize;

use super::http;
use super::BlockExplorer;
use crate::error::{Error, Provider, Result};
use crate::types::BlockDirection;

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

pub struct EtherscanClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EtherscanClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(Error::FatalConfig("etherscan url is not configured".to_string()));
        }
        if api_key.trim().is_empty() {
            return Err(Error::FatalConfig("ETHERSCAN_API_KEY is not configured".to_string()));
        }
        Ok(Self {
            http: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn block_by_time_url(&self, unix: i64, closest: BlockDirection) -> String {
        format!(
            "{}?module=block&action=getblocknobytime&timestamp={unix}&closest={}&apikey={}",
            self.base_url,
            closest.as_str(),
            urlencoding::encode(&self.api_key)
        )
    }

    async fn fetch_block_by_time(&self, unix: i64, closest: BlockDirection) -> Result<u64> {
        let resp = self
            .http
            .get(self.block_by_time_url(unix, closest))
            .send()
            .await
            .map_err(|e| http::transport_error(Provider::Etherscan, &e))?;
        let resp = http::check_status(Provider::Etherscan, resp).await?;
        let body: EtherscanResponse = resp
            .json()
            .await
            .map_err(|e| Error::transient(Provider::Etherscan, format!("bad response: {e}")))?;
        parse_block_response(&body)
    }
}

fn parse_block_response(body: &EtherscanResponse) -> Result<u64> {
    let result = match &body.result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if body.status != "1" {
        // Etherscan reports throttling as a status-0 body rather than HTTP 429.
        if result.to_ascii_lowercase().contains("rate limit") {
            metrics::counter!("evaluator_rate_limits_total", "provider" => Provider::Etherscan.as_str())
                .increment(1);
            return Err(Error::RateLimited {
                provider: Provider::Etherscan,
                retry_after: Provider::Etherscan.default_retry_after(),
            });
        }
        return Err(Error::transient(
            Provider::Etherscan,
            format!("getblocknobytime failed: {} ({result})", body.message),
        ));
    }
    result
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::transient(Provider::Etherscan, format!("bad block number {result:?}: {e}")))
}

impl BlockExplorer for EtherscanClient {
    async fn block_at_time(&self, unix: i64, closest: BlockDirection) -> Result<u64> {
        http::instrumented("etherscan_getblocknobytime", self.fetch_block_by_time(unix, closest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(status: &str, message: &str, result: serde_json::Value) -> EtherscanResponse {
        EtherscanResponse {
            status: status.to_string(),
            message: message.to_string(),
            result,
        }
    }

    #[test]
    fn test_url_carries_direction_and_key() {
        let c = EtherscanClient::new("https://api.etherscan.io/api/", "k&y", Duration::from_secs(5)).unwrap();
        let url = c.block_by_time_url(1_760_122_800, BlockDirection::After);
        assert_eq!(
            url,
            "https://api.etherscan.io/api?module=block&action=getblocknobytime&timestamp=1760122800&closest=after&apikey=k%26y"
        );
    }

    #[test]
    fn test_missing_key_is_fatal_config() {
        let err = EtherscanClient::new("https://api.etherscan.io/api", "", Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(matches!(err, Error::FatalConfig(_)));
    }

    #[test]
    fn test_parse_block_response() {
        let ok = body("1", "OK", serde_json::json!("23545123"));
        assert_eq!(parse_block_response(&ok).unwrap(), 23_545_123);

        let err = body("0", "NOTOK", serde_json::json!("Error! No closest block found"));
        assert!(matches!(
            parse_block_response(&err),
            Err(Error::TransientFetch { .. })
        ));

        let limited = body("0", "NOTOK", serde_json::json!("Max rate limit reached"));
        assert!(parse_block_response(&limited).unwrap_err().is_rate_limited());
    }
}
