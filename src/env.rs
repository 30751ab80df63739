use anyhow::{anyhow, Result};
use dotenv::dotenv;
use std::env;
use tracing::debug;

use crate::config::PerilConfig;

pub const AMQP_URI_VAR: &str = "PERIL_AMQP_URI";
pub const LEGACY_AMQP_URI_VAR: &str = "AMQP_ADDR";
pub const CONNECT_TIMEOUT_VAR: &str = "PERIL_CONNECT_TIMEOUT_MS";
pub const PREFETCH_COUNT_VAR: &str = "PERIL_PREFETCH_COUNT";
pub const DEAD_LETTER_EXCHANGE_VAR: &str = "PERIL_DEAD_LETTER_EXCHANGE";

/// Loads `.env` if present and applies process environment overrides.
pub fn apply_env_overrides(config: &mut PerilConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |name| env::var(name).ok())
}

/// Applies overrides from any variable source.
pub fn apply_overrides_from<F>(config: &mut PerilConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup(AMQP_URI_VAR).or_else(|| lookup(LEGACY_AMQP_URI_VAR)) {
        debug!("Using AMQP URI from the environment");
        config.connection.uri = uri;
    }
    if let Some(value) = lookup(CONNECT_TIMEOUT_VAR) {
        config.connection.connection_timeout_ms = value
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", CONNECT_TIMEOUT_VAR, value))?;
    }
    if let Some(value) = lookup(PREFETCH_COUNT_VAR) {
        config.subscription.prefetch_count = value
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", PREFETCH_COUNT_VAR, value))?;
    }
    if let Some(exchange) = lookup(DEAD_LETTER_EXCHANGE_VAR) {
        config.routing.dead_letter_exchange = exchange;
    }

    config.validate()
}
