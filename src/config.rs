//! Executor configuration

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::exec::Executor;
use crate::intercept::{ConcurrencyLimiter, InterceptorChain, WindowRateLimiter};
use crate::sqlite::{SqliteClient, SqliteConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite database path
    pub db_path: String,

    /// Max executor calls in flight (0 = unbounded)
    pub max_concurrency: usize,

    /// Rate limit max requests per window (0 = unlimited)
    pub rate_limit_max: u32,

    /// Rate limit window seconds
    pub rate_limit_window_secs: u64,

    /// Deadline for calls whose context has none, milliseconds (0 = none)
    pub statement_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            max_concurrency: 0,
            rate_limit_max: 0,
            rate_limit_window_secs: 60,
            statement_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Loads settings from `RUST_DML_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            db_path: env::var("RUST_DML_DB_PATH").unwrap_or(defaults.db_path),

            max_concurrency: env::var("RUST_DML_MAX_CONCURRENCY")
                .unwrap_or_else(|_| defaults.max_concurrency.to_string())
                .parse()?,

            rate_limit_max: env::var("RUST_DML_RATE_LIMIT_MAX")
                .unwrap_or_else(|_| defaults.rate_limit_max.to_string())
                .parse()?,

            rate_limit_window_secs: env::var("RUST_DML_RATE_LIMIT_WINDOW_SECS")
                .unwrap_or_else(|_| defaults.rate_limit_window_secs.to_string())
                .parse()?,

            statement_timeout_ms: env::var("RUST_DML_STATEMENT_TIMEOUT_MS")
                .unwrap_or_else(|_| defaults.statement_timeout_ms.to_string())
                .parse()?,
        })
    }

    pub fn sqlite(&self) -> SqliteConfig {
        SqliteConfig::new(&self.db_path)
    }
}

impl Executor {
    /// Opens the configured SQLite database and wires the limiters.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = SqliteClient::open(&config.sqlite())?;

        let mut chain = InterceptorChain::new();
        if config.max_concurrency > 0 {
            chain = chain.with(Arc::new(ConcurrencyLimiter::new(config.max_concurrency)));
        }
        if config.rate_limit_max > 0 {
            chain = chain.with(Arc::new(WindowRateLimiter::new(
                config.rate_limit_max,
                Duration::from_secs(config.rate_limit_window_secs),
            )));
        }

        let mut builder = Executor::builder()
            .client(Arc::new(client))
            .interceptor(Arc::new(chain));
        if config.statement_timeout_ms > 0 {
            builder = builder.default_timeout(Duration::from_millis(config.statement_timeout_ms));
        }
        tracing::info!("executor configured: {:?}", config);
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.db_path, ":memory:");
        assert_eq!(config.sqlite(), SqliteConfig::in_memory());
    }

    #[tokio::test]
    async fn test_from_config_pings() {
        let config = Config {
            max_concurrency: 4,
            rate_limit_max: 100,
            ..Config::default()
        };
        let executor = Executor::from_config(&config).unwrap();
        assert!(executor.ping(None).await.is_ok());
    }
}
