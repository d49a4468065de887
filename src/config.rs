use std::{env, time::Duration};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MINT: &str = "FdqJXzo2TE3BL3mh3gUJx8fEsjHCJj9mYsYdShDHpump";

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Subject
    pub mint: String,

    // Listener
    pub host: String,
    pub port: u16,
    pub static_dir: String,
    pub warm_on_start: bool,

    // Cache
    pub cache_ttl_ms: u64,
    pub adaptive_ttl_streak: u32, // 0 disables
    pub adaptive_ttl_ms: u64,

    // Upstream pacing
    pub upstream_timeout_ms: u64,
    pub upstream_min_interval_ms: u64,
    pub rate_limit_default_backoff_ms: u64,
    pub rate_limit_max_backoff_ms: u64,

    // Providers
    pub birdeye_api_key: Option<String>,
    pub birdeye_base_url: String,
    pub birdeye_chain: String,
    pub solana_rpc_url: String,
    pub dexscreener_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mint: DEFAULT_MINT.to_string(),
            host: "0.0.0.0".to_string(),
            port: 8787,
            static_dir: "./".to_string(),
            warm_on_start: true,
            cache_ttl_ms: 12_000,
            adaptive_ttl_streak: 0,
            adaptive_ttl_ms: 60_000,
            upstream_timeout_ms: 8_000,
            upstream_min_interval_ms: 1_000,
            rate_limit_default_backoff_ms: 1_000,
            rate_limit_max_backoff_ms: 2_000,
            birdeye_api_key: None,
            birdeye_base_url: "https://public-api.birdeye.so".to_string(),
            birdeye_chain: "solana".to_string(),
            solana_rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            dexscreener_base_url: "https://api.dexscreener.com".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Self::default();

        let port = get_env_u64("PORT", d.port as u64)?;
        if port > u16::MAX as u64 {
            return Err(anyhow!("PORT out of range (got {port})"));
        }

        let s = Self {
            mint: get_env_string("MINT", &d.mint),
            host: get_env_string("HOST", &d.host),
            port: port as u16,
            static_dir: get_env_string("STATIC_DIR", &d.static_dir),
            warm_on_start: get_env_bool("WARM_ON_START", d.warm_on_start),
            cache_ttl_ms: get_env_u64("CACHE_TTL_MS", d.cache_ttl_ms)?,
            adaptive_ttl_streak: get_env_u64("ADAPTIVE_TTL_STREAK", d.adaptive_ttl_streak as u64)?
                .min(u32::MAX as u64) as u32,
            adaptive_ttl_ms: get_env_u64("ADAPTIVE_TTL_MS", d.adaptive_ttl_ms)?,
            upstream_timeout_ms: get_env_u64("UPSTREAM_TIMEOUT_MS", d.upstream_timeout_ms)?,
            upstream_min_interval_ms: get_env_u64(
                "UPSTREAM_MIN_INTERVAL_MS",
                d.upstream_min_interval_ms,
            )?,
            rate_limit_default_backoff_ms: get_env_u64(
                "RATE_LIMIT_DEFAULT_BACKOFF_MS",
                d.rate_limit_default_backoff_ms,
            )?,
            rate_limit_max_backoff_ms: get_env_u64(
                "RATE_LIMIT_MAX_BACKOFF_MS",
                d.rate_limit_max_backoff_ms,
            )?,
            birdeye_api_key: get_env("BIRDEYE_API_KEY"),
            birdeye_base_url: get_env_string("BIRDEYE_BASE_URL", &d.birdeye_base_url),
            birdeye_chain: get_env_string("BIRDEYE_CHAIN", &d.birdeye_chain),
            solana_rpc_url: get_env_string("SOLANA_RPC_URL", &d.solana_rpc_url),
            dexscreener_base_url: get_env_string("DEXSCREENER_BASE_URL", &d.dexscreener_base_url),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn adaptive_ttl(&self) -> Duration {
        Duration::from_millis(self.adaptive_ttl_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.upstream_min_interval_ms)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_default_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_max_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mint.trim().is_empty() {
            return Err(anyhow!("MINT must not be empty"));
        }
        if self.cache_ttl_ms < 1 {
            return Err(anyhow!("CACHE_TTL_MS must be >= 1 (got {})", self.cache_ttl_ms));
        }
        if self.adaptive_ttl_streak > 0 && self.adaptive_ttl_ms < self.cache_ttl_ms {
            return Err(anyhow!(
                "ADAPTIVE_TTL_MS must be >= CACHE_TTL_MS (adaptive_ttl_ms={} cache_ttl_ms={})",
                self.adaptive_ttl_ms,
                self.cache_ttl_ms
            ));
        }
        if self.upstream_timeout_ms < 1 {
            return Err(anyhow!(
                "UPSTREAM_TIMEOUT_MS must be >= 1 (got {})",
                self.upstream_timeout_ms
            ));
        }
        if self.rate_limit_default_backoff_ms > self.rate_limit_max_backoff_ms {
            return Err(anyhow!(
                "RATE_LIMIT_DEFAULT_BACKOFF_MS must be <= RATE_LIMIT_MAX_BACKOFF_MS (default={} max={})",
                self.rate_limit_default_backoff_ms,
                self.rate_limit_max_backoff_ms
            ));
        }
        for (key, url) in [
            ("BIRDEYE_BASE_URL", &self.birdeye_base_url),
            ("SOLANA_RPC_URL", &self.solana_rpc_url),
            ("DEXSCREENER_BASE_URL", &self.dexscreener_base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("{key} must be an http(s) url (got {url})"));
            }
        }
        Ok(())
    }
}
