//! Relay Configuration
//!
//! Loaded from the process environment (after `.env`), with defaults that
//! match the userscript's expectations: producer socket on 8080, API on 3000.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

use crate::relay::protocol::WireDialect;
use crate::relay::CompletionStrategy;

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_MAX_GENERATION_SECS: u64 = 300;
/// Upper bounds on the timing knobs.
pub const MAX_DEBOUNCE_MS: u64 = 10 * 60 * 1000;
pub const MAX_GENERATION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Consumer-facing HTTP listener
    pub http_addr: SocketAddr,
    /// Producer WebSocket listener
    pub producer_addr: SocketAddr,
    /// Quiescence window after the last fragment
    pub debounce: Duration,
    /// Hard ceiling on a single generation
    pub max_generation: Duration,
    pub strategy: CompletionStrategy,
    /// Event names emitted towards the producer
    pub dialect: WireDialect,
    /// Send `reset-session` before every `start-generation`
    pub reset_each_request: bool,
    /// Reported as `model` in completion responses
    pub model_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            producer_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_generation: Duration::from_secs(DEFAULT_MAX_GENERATION_SECS),
            strategy: CompletionStrategy::Quiescence,
            dialect: WireDialect::Canonical,
            reset_each_request: false,
            model_name: "web-relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Read configuration from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup; unset keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(addr) = get("RELAY_HTTP_ADDR") {
            config.http_addr = addr.parse().with_context(|| format!("Invalid RELAY_HTTP_ADDR '{}'", addr))?;
        }
        if let Some(addr) = get("RELAY_PRODUCER_ADDR") {
            config.producer_addr = addr.parse().with_context(|| format!("Invalid RELAY_PRODUCER_ADDR '{}'", addr))?;
        }
        if let Some(ms) = get("RELAY_DEBOUNCE_MS") {
            let ms: u64 = ms.parse().with_context(|| format!("Invalid RELAY_DEBOUNCE_MS '{}'", ms))?;
            if ms == 0 || ms > MAX_DEBOUNCE_MS {
                bail!("RELAY_DEBOUNCE_MS must be between 1 and {}", MAX_DEBOUNCE_MS);
            }
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = get("RELAY_MAX_GENERATION_SECS") {
            let secs: u64 = secs.parse().with_context(|| format!("Invalid RELAY_MAX_GENERATION_SECS '{}'", secs))?;
            if secs == 0 || secs > MAX_GENERATION_SECS {
                bail!("RELAY_MAX_GENERATION_SECS must be between 1 and {}", MAX_GENERATION_SECS);
            }
            config.max_generation = Duration::from_secs(secs);
        }
        if let Some(strategy) = get("RELAY_COMPLETION_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        if let Some(dialect) = get("RELAY_WIRE_DIALECT") {
            config.dialect = dialect.parse()?;
        }
        if let Some(flag) = get("RELAY_RESET_EACH_REQUEST") {
            config.reset_each_request = parse_flag(&flag)
                .with_context(|| format!("Invalid RELAY_RESET_EACH_REQUEST '{}'", flag))?;
        }
        if let Some(name) = get("RELAY_MODEL_NAME") {
            config.model_name = name;
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}
