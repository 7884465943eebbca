// =============================================================================
// Gateway — unified signed-REST façade to the exchange order endpoints
// =============================================================================
//
// One client per exchange, each exposing market_buy / market_sell /
// close_position. Credentials arrive as call parameters and are never stored
// or cached: the gateway knows nothing about the client roster. Errors
// propagate as structured results; the gateway never retries — in this domain
// a duplicated order is worse than a missed one.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod okx;

use anyhow::{Context, Result};

use crate::config::{MARKET_DATA_TIMEOUT_SECS, ORDER_TIMEOUT_SECS};

/// Exchange API credentials for a single account, passed per call.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    /// Required by OKX, absent elsewhere.
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Outcome of a close_position call.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// The base balance was sold; raw exchange response attached.
    Closed(serde_json::Value),
    /// The account held no base currency — success with nothing to do.
    NothingToClose,
}

/// HTTP client for order placement (10 s timeout).
pub(crate) fn order_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(ORDER_TIMEOUT_SECS))
        .build()
        .expect("failed to build reqwest client")
}

/// HTTP client for ticker and balance reads (5 s timeout).
pub(crate) fn data_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(MARKET_DATA_TIMEOUT_SECS))
        .build()
        .expect("failed to build reqwest client")
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Round a base-currency quantity to 6 decimal places, the common lot
/// precision across the supported spot markets.
pub(crate) fn round_qty(qty: f64) -> f64 {
    (qty * 1e6).round() / 1e6
}
