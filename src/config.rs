//! Environment-loaded configuration.
//!
//! `dotenv().ok()` first, then
//! `env::var(..).unwrap_or_else(..).parse().unwrap_or(default)` per
//! field, with hard failure only for the one genuinely required secret.

use anyhow::{bail, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub poll_interval_seconds: u64,
    pub max_monitored_fixtures: usize,
    pub upstream_budget_per_hour: u32,
    pub upstream_min_delay_ms: u64,
    pub ingestion_concurrency: usize,
    pub evaluator_concurrency: usize,
    pub default_cooldown_seconds: u64,
    pub event_buffer_size: usize,
    pub pattern_retention_seconds: i64,
    pub upstream_api_key: String,
    pub broadcast_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./matchwatch.db".to_string());

        let poll_interval_seconds = env::var("POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .unwrap_or(300)
            .clamp(60, 600);

        let max_monitored_fixtures = env::var("MAX_MONITORED_FIXTURES")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let upstream_budget_per_hour = env::var("UPSTREAM_BUDGET_PER_HOUR")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let upstream_min_delay_ms = env::var("UPSTREAM_MIN_DELAY_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let ingestion_concurrency = env::var("INGESTION_CONCURRENCY")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let evaluator_concurrency = env::var("EVALUATOR_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));

        let default_cooldown_seconds = env::var("DEFAULT_COOLDOWN_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let event_buffer_size = env::var("EVENT_BUFFER_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);

        let pattern_retention_seconds = env::var("PATTERN_RETENTION_SECONDS")
            .unwrap_or_else(|_| "7200".to_string())
            .parse()
            .unwrap_or(7200);

        let upstream_api_key = match env::var("UPSTREAM_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("UPSTREAM_API_KEY is required and was not set"),
        };

        let broadcast_buffer_size = env::var("BROADCAST_BUFFER_SIZE")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);

        Ok(Self {
            database_path,
            poll_interval_seconds,
            max_monitored_fixtures,
            upstream_budget_per_hour,
            upstream_min_delay_ms,
            ingestion_concurrency,
            evaluator_concurrency,
            default_cooldown_seconds,
            event_buffer_size,
            pattern_retention_seconds,
            upstream_api_key,
            broadcast_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_clamped() {
        env::set_var("UPSTREAM_API_KEY", "test-key");
        env::set_var("POLL_INTERVAL_SECONDS", "30");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.poll_interval_seconds, 60);

        env::set_var("POLL_INTERVAL_SECONDS", "9000");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.poll_interval_seconds, 600);

        env::remove_var("POLL_INTERVAL_SECONDS");
        env::remove_var("UPSTREAM_API_KEY");
    }

    #[test]
    fn missing_api_key_is_fatal() {
        env::remove_var("UPSTREAM_API_KEY");
        // Ensure no .env file in the test working directory supplies it.
        let result = Config::from_env();
        assert!(result.is_err());
    }
}
