//! Command line and environment configuration.
//!
//! Every flag can also come from an `ODY_*` environment variable so the
//! server can be configured the same way in containers and on the shell.

use crate::auth::{AllowAnyToken, StaticTokens, TokenVerifier};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Tunables of the connection lifecycle core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Decoded envelopes buffered per connection before the newest is dropped.
    pub inbound_capacity: usize,
    /// Envelopes buffered per connection before `send` reports `Congested`.
    pub outbound_capacity: usize,
    /// Capacity of the join channel towards the simulation.
    pub join_capacity: usize,
    /// How long admission waits for room on the join channel.
    pub publish_timeout: Duration,
    /// Upper bound for each step of a single connection's teardown.
    pub teardown_timeout: Duration,
    /// How long shutdown waits for all connections to drain.
    pub shutdown_grace: Duration,
    /// Consecutive undecodable frames tolerated before the connection is
    /// closed. Zero tolerates any number.
    pub max_consecutive_malformed: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 10,
            outbound_capacity: 10,
            join_capacity: 10,
            publish_timeout: Duration::from_secs(2),
            teardown_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            max_consecutive_malformed: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid registry URL {url}: {reason}")]
    InvalidRegistryUrl { url: String, reason: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Command line arguments of the server binary.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to bind the client listener to
    #[arg(short = 'H', long, env = "ODY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for client WebSocket connections
    #[arg(short, long, env = "ODY_NETWORK_PORT", default_value = "8080")]
    pub port: u16,

    /// Port for the plain HTTP health endpoint
    #[arg(long, env = "ODY_META_PORT", default_value = "8082")]
    pub meta_port: u16,

    /// Simulation tick rate (updates per second)
    #[arg(short, long, env = "ODY_TICK_RATE", default_value = "30")]
    pub tick_rate: u32,

    /// Registry the server announces itself to
    #[arg(
        long,
        env = "ODY_REGISTRY_URL",
        default_value = "http://local.fosteredgames.com:8080"
    )]
    pub registry: String,

    /// Accepted bearer tokens. Any non-empty token is accepted when none are given
    #[arg(long = "token", env = "ODY_ACCESS_TOKENS", value_delimiter = ',')]
    pub tokens: Vec<String>,

    /// Per-connection inbound queue capacity
    #[arg(long, env = "ODY_INBOUND_CAPACITY", default_value = "10")]
    pub inbound_capacity: usize,

    /// Per-connection outbound queue capacity
    #[arg(long, env = "ODY_OUTBOUND_CAPACITY", default_value = "10")]
    pub outbound_capacity: usize,

    /// Capacity of the new-client channel towards the simulation
    #[arg(long, env = "ODY_JOIN_CAPACITY", default_value = "10")]
    pub join_capacity: usize,

    /// How long admission waits for the simulation, in milliseconds
    #[arg(long, env = "ODY_PUBLISH_TIMEOUT_MS", default_value = "2000")]
    pub publish_timeout_ms: u64,

    /// Per-connection teardown bound, in milliseconds
    #[arg(long, env = "ODY_TEARDOWN_TIMEOUT_MS", default_value = "1000")]
    pub teardown_timeout_ms: u64,

    /// Shutdown grace period, in milliseconds
    #[arg(long, env = "ODY_SHUTDOWN_GRACE_MS", default_value = "5000")]
    pub shutdown_grace_ms: u64,

    /// Consecutive malformed frames before a client is dropped (0 = never)
    #[arg(long, env = "ODY_MAX_MALFORMED", default_value = "5")]
    pub max_malformed: usize,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub meta_addr: String,
    pub tick_rate: u32,
    pub registry_url: Url,
    pub access_tokens: Vec<String>,
    pub network: NetworkConfig,
}

impl Args {
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Zero("tick rate"));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Zero("inbound capacity"));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Zero("outbound capacity"));
        }
        if self.join_capacity == 0 {
            return Err(ConfigError::Zero("join capacity"));
        }

        let registry_url = parse_registry_url(&self.registry)?;
        let access_tokens = self
            .tokens
            .into_iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();

        Ok(ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            meta_addr: format!("{}:{}", self.host, self.meta_port),
            tick_rate: self.tick_rate,
            registry_url,
            access_tokens,
            network: NetworkConfig {
                inbound_capacity: self.inbound_capacity,
                outbound_capacity: self.outbound_capacity,
                join_capacity: self.join_capacity,
                publish_timeout: Duration::from_millis(self.publish_timeout_ms),
                teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
                shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
                max_consecutive_malformed: self.max_malformed,
            },
        })
    }
}

impl ServerConfig {
    /// Token verifier implied by the configured access tokens.
    pub fn verifier(&self) -> Arc<dyn TokenVerifier> {
        if self.access_tokens.is_empty() {
            Arc::new(AllowAnyToken)
        } else {
            Arc::new(StaticTokens::new(self.access_tokens.iter().cloned()))
        }
    }
}

/// Parses a registry URL, requiring both a scheme and a host.
pub fn parse_registry_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidRegistryUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidRegistryUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}
