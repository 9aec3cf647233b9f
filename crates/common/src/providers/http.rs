use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};

use crate::error::{Error, Provider, Result};

/// Retry settings for transient failures. Rate limits are never retried here;
/// they are surfaced so the caller's back-off loop can handle them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(250),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * self.factor.saturating_pow(attempt);
        let max_jitter = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        backoff + Duration::from_millis(jitter)
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::FatalConfig(format!("failed to build http client: {e}")))
}

pub(crate) fn transport_error(provider: Provider, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::transient(provider, format!("request timed out: {e}"))
    } else {
        Error::transient(provider, e.to_string())
    }
}

fn retry_after(provider: Provider, response: &Response) -> Duration {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or_else(|| provider.default_retry_after(), Duration::from_secs)
}

pub(crate) fn is_range_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("block range") || m.contains("range too large") || m.contains("query returned more than")
}

/// Map non-success statuses onto the error taxonomy.
pub(crate) async fn check_status(provider: Provider, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after(provider, &response);
        tracing::warn!(%provider, ?retry_after, "provider rate limit hit");
        metrics::counter!("evaluator_rate_limits_total", "provider" => provider.as_str()).increment(1);
        return Err(Error::RateLimited {
            provider,
            retry_after,
        });
    }
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST && is_range_message(&body) {
        return Err(Error::RangeTooLarge {
            provider,
            message: body,
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::FatalConfig(format!("{provider} rejected credentials: HTTP {status}")));
    }
    Err(Error::transient(provider, format!("HTTP {status}: {body}")))
}

/// Record latency and outcome for one logical request.
pub(crate) async fn instrumented<T, Fut>(endpoint: &'static str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let res = fut.await;
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("evaluator_api_latency_ms", "endpoint" => endpoint).record(ms);
    let status = match &res {
        Ok(_) => "ok",
        Err(Error::RateLimited { .. }) => "rate_limited",
        Err(_) => "error",
    };
    metrics::counter!("evaluator_api_requests_total", "endpoint" => endpoint, "status" => status)
        .increment(1);
    res
}

/// Retry `op` on transient failures with exponential back-off and jitter.
pub(crate) async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e @ Error::TransientFetch { .. }) if attempt < policy.retries => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, error = %e, "transient provider error; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
