use std::time::Duration;

use crate::error::ConfigError;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("QUARRY_HTTP_CONNECT_TIMEOUT_SECS", 5).max(1))
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("QUARRY_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("QUARRY_HTTP_POOL_IDLE_SECS", 90).max(1))
}

fn user_agent() -> String {
    format!("quarry/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults. Apply per-call `.timeout(...)` as needed.
pub fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout())
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
}

/// Client without a whole-request timeout, for long streaming transfers.
pub fn streaming_client() -> Result<reqwest::Client, ConfigError> {
    builder().build().map_err(|e| ConfigError::Http(e.to_string()))
}

/// Client with a specific request timeout.
pub fn client_with_timeout(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Http(e.to_string()))
}
