// =============================================================================
// Binance REST gateway — HMAC-SHA256 signed query strings
// =============================================================================
//
// The signature is a hex HMAC over the full query string; the API key travels
// in the X-MBX-APIKEY header. Binance market orders take a base-currency
// `quantity`, so buys and sells first read the ticker price and convert the
// USD notional to `round(usd / price, 6)`.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use crate::gateway::{parse_str_f64, round_qty, CloseOutcome, Credentials};
use crate::symbol::Symbol;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance signed REST client. Credentials are per-call parameters.
#[derive(Clone)]
pub struct BinanceGateway {
    client: reqwest::Client,
    data_client: reqwest::Client,
    base_url: String,
}

impl BinanceGateway {
    pub fn new() -> Self {
        Self {
            client: super::order_client(),
            data_client: super::data_client(),
            base_url: "https://api.binance.com".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Hex HMAC-SHA256 signature of `query`.
    fn sign(secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(creds: &Credentials, params: &str) -> String {
        let ts = crate::types::now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(&creds.api_secret, &base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Raw calls
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price (public) — last price for a native symbol.
    async fn ticker_price(&self, native: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={native}", self.base_url);
        let resp = self
            .data_client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;
        if !status.is_success() {
            anyhow::bail!("Binance ticker read returned {status}: {body}");
        }

        let price = parse_str_f64(&body["price"]).context("ticker response missing price")?;
        if price <= 0.0 {
            anyhow::bail!("Binance returned non-positive price for {native}");
        }
        Ok(price)
    }

    /// POST /api/v3/order (signed) — spot market order with base quantity.
    async fn place_market_order(
        &self,
        creds: &Credentials,
        native: &str,
        side: &str,
        quantity: f64,
    ) -> Result<serde_json::Value> {
        let params = format!("symbol={native}&side={side}&type=MARKET&quantity={quantity}");
        let qs = Self::signed_query(creds, &params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(native, side, quantity, "placing Binance market order");

        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;
        if !status.is_success() {
            anyhow::bail!("Binance POST /api/v3/order returned {status}: {body}");
        }

        debug!(native, side, "Binance order accepted");
        Ok(body)
    }

    /// GET /api/v3/account (signed) — free balance of one asset.
    async fn free_balance(&self, creds: &Credentials, asset: &str) -> Result<f64> {
        let qs = Self::signed_query(creds, "");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/account returned {status}: {body}");
        }

        let balances = body["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;
        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                return parse_str_f64(&b["free"]);
            }
        }
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Market buy `usd` worth of `symbol`, converted to base quantity at the
    /// current ticker price.
    pub async fn market_buy(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
        usd: f64,
    ) -> Result<serde_json::Value> {
        let native = symbol.to_binance();
        let price = self.ticker_price(&native).await?;
        let qty = round_qty(usd / price);
        if qty <= 0.0 {
            anyhow::bail!("order notional {usd} too small for {native} at price {price}");
        }
        self.place_market_order(creds, &native, "BUY", qty).await
    }

    /// Market sell `usd` worth of `symbol`.
    pub async fn market_sell(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
        usd: f64,
    ) -> Result<serde_json::Value> {
        let native = symbol.to_binance();
        let price = self.ticker_price(&native).await?;
        let qty = round_qty(usd / price);
        if qty <= 0.0 {
            anyhow::bail!("order notional {usd} too small for {native} at price {price}");
        }
        self.place_market_order(creds, &native, "SELL", qty).await
    }

    /// Sell the whole free balance of the symbol's base asset. Uses the
    /// explicit base field of the canonical symbol rather than deriving the
    /// asset from the native pair string.
    pub async fn close_position(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
    ) -> Result<CloseOutcome> {
        let free = self.free_balance(creds, symbol.base()).await?;
        let qty = round_qty(free);
        if qty <= 0.0 {
            info!(symbol = %symbol, "no free Binance balance to close");
            return Ok(CloseOutcome::NothingToClose);
        }

        let resp = self
            .place_market_order(creds, &symbol.to_binance(), "SELL", qty)
            .await?;
        Ok(CloseOutcome::Closed(resp))
    }
}

impl Default for BinanceGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BinanceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}
