// =============================================================================
// OKX REST gateway — HMAC-SHA256 + base64 signed requests
// =============================================================================
//
// Signature prehash is `timestamp + method + path + body` with an ISO-8601
// millisecond timestamp; the result is base64-encoded and sent alongside the
// key, timestamp, and passphrase headers. Market orders use `tdMode=cash`
// with `sz` as quote-currency notional (USDT).
// =============================================================================

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use crate::gateway::{parse_str_f64, CloseOutcome, Credentials};
use crate::symbol::Symbol;

type HmacSha256 = Hmac<Sha256>;

const ORDER_PATH: &str = "/api/v5/trade/order";
const BALANCE_PATH: &str = "/api/v5/account/balance";

/// OKX signed REST client. Credentials are per-call parameters.
#[derive(Clone)]
pub struct OkxGateway {
    client: reqwest::Client,
    base_url: String,
}

impl OkxGateway {
    pub fn new() -> Self {
        Self {
            client: super::order_client(),
            base_url: "https://www.okx.com".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// ISO-8601 UTC timestamp with millisecond precision, as OKX expects.
    fn iso_timestamp() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    /// base64(HMAC-SHA256(secret, timestamp + method + path + body)).
    fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn signed_headers(
        creds: &Credentials,
        timestamp: &str,
        signature: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("OK-ACCESS-KEY", creds.api_key.clone()),
            ("OK-ACCESS-SIGN", signature.to_string()),
            ("OK-ACCESS-TIMESTAMP", timestamp.to_string()),
            (
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            ),
        ]
    }

    // -------------------------------------------------------------------------
    // Raw calls
    // -------------------------------------------------------------------------

    /// POST /api/v5/trade/order (signed) — spot market order.
    ///
    /// `sz` is quote notional for plain buys/sells; when `tgt_ccy` is
    /// `base_ccy` (the close path) it is a base quantity instead.
    async fn place_market_order(
        &self,
        creds: &Credentials,
        inst_id: &str,
        side: &str,
        sz: f64,
        tgt_ccy: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut order = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": side,
            "ordType": "market",
            "sz": sz.to_string(),
        });
        if let Some(tgt) = tgt_ccy {
            order["tgtCcy"] = serde_json::Value::String(tgt.to_string());
        }
        let body = serde_json::to_string(&order).context("failed to serialise OKX order body")?;

        let timestamp = Self::iso_timestamp();
        let signature = Self::sign(&creds.api_secret, &timestamp, "POST", ORDER_PATH, &body);

        debug!(inst_id, side, sz, "placing OKX market order");

        let mut request = self
            .client
            .post(format!("{}{ORDER_PATH}", self.base_url))
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in Self::signed_headers(creds, &timestamp, &signature) {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .context("POST /api/v5/trade/order request failed")?;
        let status = resp.status();
        let body: serde_json::Value =
            resp.json().await.context("failed to parse OKX order response")?;

        if !status.is_success() || body["code"].as_str() != Some("0") {
            anyhow::bail!("OKX order rejected ({status}): {body}");
        }

        debug!(inst_id, side, "OKX order accepted");
        Ok(body)
    }

    /// GET /api/v5/account/balance?ccy=... (signed) — cash balance of one
    /// currency.
    async fn cash_balance(&self, creds: &Credentials, ccy: &str) -> Result<f64> {
        let path = format!("{BALANCE_PATH}?ccy={ccy}");
        let timestamp = Self::iso_timestamp();
        let signature = Self::sign(&creds.api_secret, &timestamp, "GET", &path, "");

        let mut request = self.client.get(format!("{}{path}", self.base_url));
        for (name, value) in Self::signed_headers(creds, &timestamp, &signature) {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .context("GET /api/v5/account/balance request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse OKX balance response")?;

        if !status.is_success() || body["code"].as_str() != Some("0") {
            anyhow::bail!("OKX balance read rejected ({status}): {body}");
        }

        let balance = body["data"][0]["details"][0]
            .get("cashBal")
            .map(parse_str_f64)
            .transpose()?
            .unwrap_or(0.0);
        Ok(balance)
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Market buy `usd` worth of `symbol` (quote notional).
    pub async fn market_buy(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
        usd: f64,
    ) -> Result<serde_json::Value> {
        self.place_market_order(creds, &symbol.to_okx(), "buy", usd, None)
            .await
    }

    /// Market sell `usd` worth of `symbol` (quote notional).
    pub async fn market_sell(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
        usd: f64,
    ) -> Result<serde_json::Value> {
        self.place_market_order(creds, &symbol.to_okx(), "sell", usd, None)
            .await
    }

    /// Read the spot cash balance of the base currency and market-sell the
    /// whole of it.
    pub async fn close_position(
        &self,
        creds: &Credentials,
        symbol: &Symbol,
    ) -> Result<CloseOutcome> {
        let balance = self.cash_balance(creds, symbol.base()).await?;
        if balance <= 0.0 {
            info!(symbol = %symbol, "no OKX cash balance to close");
            return Ok(CloseOutcome::NothingToClose);
        }

        let resp = self
            .place_market_order(creds, &symbol.to_okx(), "sell", balance, Some("base_ccy"))
            .await?;
        Ok(CloseOutcome::Closed(resp))
    }
}

impl Default for OkxGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OkxGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_base64_of_prehash_hmac() {
        // Known-answer check: HMAC-SHA256("secret", ts + "GET" + path),
        // base64-encoded, must be stable across refactors.
        let sig = OkxGateway::sign(
            "secret",
            "2024-01-01T00:00:00.000Z",
            "GET",
            "/api/v5/account/balance?ccy=BTC",
            "",
        );

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"2024-01-01T00:00:00.000Z");
        mac.update(b"GET");
        mac.update(b"/api/v5/account/balance?ccy=BTC");
        let expected =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(sig, expected);
    }

    #[test]
    fn iso_timestamp_has_millisecond_precision() {
        let ts = OkxGateway::iso_timestamp();
        // e.g. 2024-06-01T12:34:56.789Z
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[19..20], ".");
    }
}
