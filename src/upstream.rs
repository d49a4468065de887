use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    config::Settings,
    extract,
    utils::{now_utc, parse_retry_after},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    BirdeyeMarketData,
    BirdeyeOverview,
    BirdeyePrice,
    Dexscreener,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::BirdeyeMarketData => "birdeye_market_data",
            Source::BirdeyeOverview => "birdeye_overview",
            Source::BirdeyePrice => "birdeye_price",
            Source::Dexscreener => "dexscreener",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out")]
    Timeout,
    #[error("http status {status}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            UpstreamError::RateLimited { retry_after }
        } else {
            UpstreamError::Http {
                status: status.as_u16(),
                retry_after,
            }
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::Extraction(format!("malformed body: {e}"))
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

/// One fallback tier: a single named provider endpoint.
#[async_trait]
pub trait Tier: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch the subject's market cap within `budget`. Must not touch shared state.
    async fn fetch(&self, subject: &str, budget: Duration) -> Result<u64, UpstreamError>;
}

fn check_request(subject: &str, budget: Duration) -> Result<(), UpstreamError> {
    if subject.trim().is_empty() {
        return Err(UpstreamError::InvalidRequest("empty subject".to_string()));
    }
    if budget.is_zero() {
        return Err(UpstreamError::InvalidRequest("zero time budget".to_string()));
    }
    Ok(())
}

/// Send with a hard budget and classify the response. The budget is enforced
/// here, never delegated to the provider.
async fn send_json(req: RequestBuilder, budget: Duration) -> Result<JsonValue, UpstreamError> {
    let call = async {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, now_utc()));
            return Err(UpstreamError::from_status(status, retry_after));
        }
        let body = resp.bytes().await?;
        serde_json::from_slice::<JsonValue>(&body)
            .map_err(|e| UpstreamError::Extraction(format!("malformed json: {e}")))
    };
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| UpstreamError::Timeout)?
}

/// HTTP-backed tier against one of the known provider endpoints.
pub struct ProviderTier {
    endpoint: Source,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chain: String,
    rpc_url: String,
}

impl ProviderTier {
    pub(crate) fn new(endpoint: Source, http: reqwest::Client, settings: &Settings) -> Self {
        let base_url = match endpoint {
            Source::Dexscreener => settings.dexscreener_base_url.clone(),
            _ => settings.birdeye_base_url.clone(),
        };
        Self {
            endpoint,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.birdeye_api_key.clone(),
            chain: settings.birdeye_chain.clone(),
            rpc_url: settings.solana_rpc_url.clone(),
        }
    }

    fn birdeye_get(&self, path: &str, subject: &str) -> RequestBuilder {
        let mut req = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&[("address", subject)])
            .header("accept", "application/json")
            .header("x-chain", &self.chain);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key);
        }
        req
    }

    fn dexscreener_url(&self, subject: &str) -> Result<reqwest::Url, UpstreamError> {
        let mut url = reqwest::Url::parse(&format!("{}/latest/dex/tokens", self.base_url))
            .map_err(|e| UpstreamError::InvalidRequest(format!("dexscreener url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidRequest("dexscreener url has no path".to_string()))?
            .push(subject);
        Ok(url)
    }

    async fn fetch_supply(&self, subject: &str, budget: Duration) -> Result<f64, UpstreamError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenSupply",
            "params": [subject]
        });
        let payload = send_json(self.http.post(&self.rpc_url).json(&body), budget).await?;
        extract::rpc_token_supply(&payload)
            .ok_or_else(|| UpstreamError::Extraction("no token supply in rpc response".to_string()))
    }
}

#[async_trait]
impl Tier for ProviderTier {
    fn source(&self) -> Source {
        self.endpoint
    }

    async fn fetch(&self, subject: &str, budget: Duration) -> Result<u64, UpstreamError> {
        check_request(subject, budget)?;
        let started = tokio::time::Instant::now();

        match self.endpoint {
            Source::BirdeyeMarketData | Source::BirdeyeOverview => {
                let path = if self.endpoint == Source::BirdeyeMarketData {
                    "/defi/v3/token/market-data"
                } else {
                    "/defi/token_overview"
                };
                let payload = send_json(self.birdeye_get(path, subject), budget).await?;
                let (mc, how) = extract::market_cap(&payload).ok_or_else(|| {
                    UpstreamError::Extraction(format!("no market cap fields in {path}"))
                })?;
                log::debug!("upstream.extracted source={} derivation={:?} mc={}", self.source(), how, mc);
                Ok(mc)
            }
            Source::BirdeyePrice => {
                let payload = send_json(self.birdeye_get("/defi/price", subject), budget).await?;
                let price = extract::price(&payload)
                    .ok_or_else(|| UpstreamError::Extraction("no price in /defi/price".to_string()))?;
                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(UpstreamError::Timeout);
                }
                let supply = self.fetch_supply(subject, remaining).await?;
                extract::round_market_cap(price * supply).ok_or_else(|| {
                    UpstreamError::Extraction(format!("price*supply not finite ({price}*{supply})"))
                })
            }
            Source::Dexscreener => {
                let payload = send_json(self.http.get(self.dexscreener_url(subject)?), budget).await?;
                extract::dexscreener_market_cap(&payload)
                    .ok_or_else(|| UpstreamError::Extraction("no pairs with mc/fdv".to_string()))
            }
        }
    }
}

/// Default tier order: field-rich endpoints first, the price-only endpoint
/// (two calls) next, a different provider last. Birdeye needs an API key.
pub fn default_tiers(settings: &Settings) -> anyhow::Result<Vec<Box<dyn Tier>>> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("mcapd/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let mut tiers: Vec<Box<dyn Tier>> = Vec::new();
    if settings.birdeye_api_key.is_some() {
        for ep in [Source::BirdeyeMarketData, Source::BirdeyeOverview, Source::BirdeyePrice] {
            tiers.push(Box::new(ProviderTier::new(ep, http.clone(), settings)));
        }
    } else {
        log::warn!("upstream.birdeye.disabled reason=no_api_key");
    }
    tiers.push(Box::new(ProviderTier::new(Source::Dexscreener, http, settings)));
    Ok(tiers)
}
