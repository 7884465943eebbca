// =============================================================================
// Engine Configuration — environment-driven settings for the core
// =============================================================================
//
// Everything here comes from the process environment (optionally via a .env
// file loaded in main). Client roster and captain settings live in the
// registry, not here: the core reads those on demand through the
// ClientRegistry interface.
// =============================================================================

use crate::gateway::Credentials;

/// Timeout for order placement calls.
pub const ORDER_TIMEOUT_SECS: u64 = 10;
/// Timeout for order-book and ticker reads.
pub const MARKET_DATA_TIMEOUT_SECS: u64 = 5;
/// Reconnect if the captain websocket is silent for this long.
pub const WS_IDLE_TIMEOUT_SECS: u64 = 30;
/// Minimum backoff before a websocket reconnect attempt.
pub const WS_RECONNECT_BACKOFF_SECS: u64 = 3;
/// Maximum concurrent exchange calls per execution packet.
pub const FLEET_DISPATCH_CAP: usize = 16;

/// Process-level configuration assembled from the environment.
#[derive(Clone)]
pub struct EngineConfig {
    /// Redis bus endpoint (`REDIS_URL`).
    pub redis_url: String,
    /// Bind address for the operational REST API (`HORUS_BIND_ADDR`).
    pub bind_addr: String,
    /// Path to the JSON client roster (`HORUS_CLIENTS_FILE`).
    pub clients_file: String,
    /// OKX private websocket endpoint for the Eye (`HORUS_OKX_WS_URL`).
    pub okx_ws_url: String,
    /// The captain's OKX credentials. When absent the Eye is not started and
    /// only console signals drive the pipeline.
    pub captain: Option<Credentials>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            bind_addr: "0.0.0.0:3001".to_string(),
            clients_file: "clients.json".to_string(),
            okx_ws_url: "wss://ws.okx.com:8443/ws/v5/private".to_string(),
            captain: None,
        }
    }
}

impl EngineConfig {
    /// Assemble configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let captain = match (
            std::env::var("OKX_API_KEY"),
            std::env::var("OKX_API_SECRET"),
        ) {
            (Ok(api_key), Ok(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
                Some(Credentials {
                    api_key,
                    api_secret,
                    passphrase: std::env::var("OKX_PASSPHRASE").ok(),
                })
            }
            _ => None,
        };

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            bind_addr: std::env::var("HORUS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            clients_file: std::env::var("HORUS_CLIENTS_FILE").unwrap_or(defaults.clients_file),
            okx_ws_url: std::env::var("HORUS_OKX_WS_URL").unwrap_or(defaults.okx_ws_url),
            captain,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("redis_url", &self.redis_url)
            .field("bind_addr", &self.bind_addr)
            .field("clients_file", &self.clients_file)
            .field("okx_ws_url", &self.okx_ws_url)
            .field("captain", &self.captain.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
