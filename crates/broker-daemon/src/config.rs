//! Environment-sourced configuration. `.env` is loaded on a best-effort
//! basis (dev convenience); production is expected to inject real env vars.

use std::time::Duration;

pub struct Config {
    pub database_url: String,
    pub lease_timeout: Duration,
    pub http_timeout: Duration,
    pub tick_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            database_url,
            lease_timeout: Duration::from_secs(env_secs(
                "BROKER_LEASE_TIMEOUT_SECS",
                broker_core::DEFAULT_LEASE_TIMEOUT_SECS as u64,
            )),
            http_timeout: Duration::from_secs(env_secs(
                "BROKER_HTTP_TIMEOUT_SECS",
                broker_core::DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            tick_interval: Duration::from_millis(env_secs("BROKER_TICK_INTERVAL_MS", 1000)),
        })
    }
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
