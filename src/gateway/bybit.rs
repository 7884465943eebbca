// =============================================================================
// Bybit v5 REST gateway — HMAC-SHA256 signed requests, spot category
// =============================================================================
//
// The signed payload is `timestamp + api_key + recv_window + body` for POSTs
// (query string in place of the body for GETs), hex-encoded into X-BAPI-SIGN.
// Spot market orders take a base `qty`, converted from the USD notional via
// the public tickers endpoint.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use crate::gateway::{parse_str_f64, round_qty, CloseOutcome, Credentials};
use crate::symbol::Symbol;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";

/// Bybit signed REST client. Credentials are per-call parameters.
#[derive(Clone)]
pub struct BybitGateway {
    client: reqwest::Client,
    data_client: reqwest::Client,
    base_url: String,
}

impl BybitGateway {
    pub fn new() -> Self {
        Self {
            client: super::order_client(),
            data_client: super::data_client(),
            base_url: "https://api.bybit.com".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Hex HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(creds: &Credentials, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(creds.api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(
        creds: &Credentials,
        timestamp: i64,
        signature: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("X-BAPI-API-KEY", creds.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp.to_string()),
            ("X-BAPI-SIGN", signature.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
        ]
    }

    /// Bail unless the HTTP status and the body's retCode both report success.
    fn check_response(status: reqwest::StatusCode, body: &serde_json::Value) -> Result<()> {
        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if !status.is_success() || ret_code != 0 {
            anyhow::bail!("Bybit request rejected ({status}): {body}");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Raw calls
    // -------------------------------------------------------------------------

    /// GET /v5/market/tickers (public) — last price for a native symbol.
    async fn ticker_price(&self, native: &str) -> Result<f64> {
        let url = format!(
            "{}/v5/market/tickers?category=spot&symbol={native}",
            self.base_url
        );
        let resp = self
            .data_client
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/tickers request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse tickers response")?;
        Self::check_response(status, &body)?;

        let price = body["result"]["list"][0]
            .get("lastPrice")
            .map(parse_str_f64)
            .transpose()?
            .unwrap_or(0.0);
        if price <= 0.0 {
            anyhow::bail!("Bybit returned non-positive price for {native}");
        }
        Ok(price)
    }

    /// POST /v5/order/create (signed) — spot market order with base quantity.
    async fn place_market_order(
        &self,
        creds: &Credentials,
        native: &str,
        side: &str,
        qty: f64,
    ) -> Result<serde_json::Value> {
        let order = serde_json::json!({
            "category": "spot",
            "symbol": native,
            "side": side,
            "orderType": "Market",
            "qty": qty.to_string(),
        });
        let body = serde_json::to_string(&order).context("failed to serialise Bybit order body")?;

        let timestamp = crate::types::now_ms();
        let signature = Self::sign(creds, timestamp, &body);

        debug!(native, side, qty, "placing Bybit market order");

        let mut request = self
            .client
            .post(format!("{}/v5/order/create", self.base_url))
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in Self::signed_headers(creds, timestamp, &signature) {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .context("POST /v5/order/create request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse Bybit order response")?;
        Self::check_response(status, &body)?;

        debug!(native, side, "Bybit order accepted");
        Ok(body)
    }

    /// GET /v5/account/wallet-balance?accountType=SPOT (signed) — free spot
    /// balance of one coin.
    async fn free_balance(&self, creds: &Credentials, coin: &str) -> Result<f64> {
        let query = format!("accountType=SPOT&coin={coin}");
        let timestamp = crate::types::now_ms();
        let signature = Self::sign(creds, timestamp, &query);

        let mut request = self.client.get(format!(
            "{}/v5/account/wallet-balance?{query}",
            self.base_url
        ));
        for (name, value) in Self::signed_headers(creds, timestamp, &signature) {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .context("GET /v5/account/wallet-balance request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse wallet-balance response")?;
        Self::check_response(status, &body)?;

        let coins = body["result"]["list"][0]["coin"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for entry in &coins {
            if entry["coin"].as_str() == Some(coin) {
                return parse_str_f64(&entry["walletBalance"]);
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
        let native = symbol.to_bybit();
        let price = self.ticker_price(&native).await?;
        let qty = round_qty(usd / price);
        if qty <= 0.0 {
            anyhow::bail!("order notional {usd} too small for {native} at price {price}");
        }
        self.place_market_order(creds, &native, "Buy", qty).await
    }

    /// Market sell `usd` worth of `symbol`.
    pub async fn market_sell(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
        usd: f64,
    ) -> Result<serde_json::Value> {
        let native = symbol.to_bybit();
        let price = self.ticker_price(&native).await?;
        let qty = round_qty(usd / price);
        if qty <= 0.0 {
            anyhow::bail!("order notional {usd} too small for {native} at price {price}");
        }
        self.place_market_order(creds, &native, "Sell", qty).await
    }

    /// Sell the whole free spot balance of the symbol's base coin.
    pub async fn close_position(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
    ) -> Result<CloseOutcome> {
        let free = self.free_balance(creds, symbol.base()).await?;
        let qty = round_qty(free);
        if qty <= 0.0 {
            info!(symbol = %symbol, "no free Bybit balance to close");
            return Ok(CloseOutcome::NothingToClose);
        }

        let resp = self
            .place_market_order(creds, &symbol.to_bybit(), "Sell", qty)
            .await?;
        Ok(CloseOutcome::Closed(resp))
    }
}

impl Default for BybitGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BybitGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}
