//! Process-wide configuration, read once at startup.
//!
//! Consolidates what would otherwise be scattered `std::env::var` calls into
//! one typed struct, each field with an explicit default.

use std::time::Duration;

use crate::fetch::FetchLimits;
use crate::identity::FederatedProvider;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub database_url: String,
    pub artifact_size_ceiling_bytes: u64,
    pub fetch_timeout: Duration,
    pub publish_deadline: Duration,
    pub rate_limit: RateLimitConfig,
    pub signing_key_cache_ttl: Duration,
    pub federated_providers: Vec<FederatedProvider>,
}

const DEFAULT_SIZE_CEILING_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PUBLISH_DEADLINE_SECS: u64 = 300;
const DEFAULT_SIGNING_KEY_CACHE_TTL_SECS: u64 = 900;

impl Config {
    pub fn from_env() -> Self {
        Config {
            listen_addr: env_or("WARES_LISTEN_ADDR", "0.0.0.0:8080"),
            database_url: env_or("WARES_DATABASE_URL", "sqlite://wares.sqlite3"),
            artifact_size_ceiling_bytes: env_parsed("WARES_ARTIFACT_SIZE_CEILING_BYTES", DEFAULT_SIZE_CEILING_BYTES),
            fetch_timeout: Duration::from_secs(env_parsed("WARES_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)),
            publish_deadline: Duration::from_secs(env_parsed(
                "WARES_PUBLISH_DEADLINE_SECS",
                DEFAULT_PUBLISH_DEADLINE_SECS,
            )),
            rate_limit: RateLimitConfig {
                rate_per_sec: env_parsed("WARES_RATE_LIMIT_PER_SEC", 5.0),
                burst: env_parsed("WARES_RATE_LIMIT_BURST", 20.0),
                publish_cost: env_parsed("WARES_RATE_LIMIT_PUBLISH_COST", 10.0),
                read_cost: env_parsed("WARES_RATE_LIMIT_READ_COST", 1.0),
            },
            signing_key_cache_ttl: Duration::from_secs(env_parsed(
                "WARES_SIGNING_KEY_CACHE_TTL_SECS",
                DEFAULT_SIGNING_KEY_CACHE_TTL_SECS,
            )),
            federated_providers: federated_providers_from_env(),
        }
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits { max_size_bytes: self.artifact_size_ceiling_bytes, deadline: self.fetch_timeout }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Federated providers are configured as `WARES_FEDERATED_PROVIDERS`, a
/// comma-separated list of `name|issuer|audience|jwks_url` quadruples.
fn federated_providers_from_env() -> Vec<FederatedProvider> {
    std::env::var("WARES_FEDERATED_PROVIDERS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .filter_map(|entry| {
                    let parts: Vec<&str> = entry.splitn(4, '|').collect();
                    match parts.as_slice() {
                        [name, issuer, audience, jwks_url] => Some(FederatedProvider {
                            name: name.to_string(),
                            issuer: issuer.to_string(),
                            audience: audience.to_string(),
                            jwks_url: jwks_url.to_string(),
                        }),
                        _ => None,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}
