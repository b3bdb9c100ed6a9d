//! # HTTP Client Module
//!
//! Builds the pooled `reqwest` client used to forward admitted requests upstream.
//!
//! ```rust
//! use floodgate::routing::client::create_upstream_client;
//!
//! let client = create_upstream_client().unwrap();
//! ```

use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::info;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 32;
const USER_AGENT: &str = concat!("floodgate/", env!("CARGO_PKG_VERSION"));

/// Upstream client settings
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// Whole-request timeout; generous because upstream work may be slow inference
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_idle_connections_per_host: usize,
    pub user_agent: String,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pool_idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            max_idle_connections_per_host: MAX_IDLE_CONNECTIONS_PER_HOST,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

pub fn create_upstream_client() -> Result<Client, reqwest::Error> {
    create_upstream_client_with_config(UpstreamClientConfig::default())
}

pub fn create_upstream_client_with_config(
    config: UpstreamClientConfig,
) -> Result<Client, reqwest::Error> {
    let client = ClientBuilder::new()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        // Redirects are the caller's business, pass them through
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.max_idle_connections_per_host)
        .build()?;

    info!(
        "Upstream HTTP client created - timeout: {}s, connect_timeout: {}s",
        config.request_timeout.as_secs(),
        config.connect_timeout.as_secs()
    );

    Ok(client)
}
