// =============================================================================
// Order Book Fetch & Liquidity Math — ask-depth inputs for the wave planner
// =============================================================================
//
// The smart entry engine only needs the top of the ask ladder (depth 40) and
// the best bid for the spread gate. All three exchange books are public
// endpoints; reads carry the market-data timeout and a failed fetch skips
// that exchange only.
// =============================================================================

use anyhow::{Context, Result};
use tracing::warn;

use crate::gateway::parse_str_f64;
use crate::symbol::Symbol;
use crate::types::Exchange;

/// Ladder depth requested from every exchange.
const BOOK_DEPTH: u32 = 40;

// ---------------------------------------------------------------------------
// Snapshot & liquidity
// ---------------------------------------------------------------------------

/// Top-of-book snapshot: ask ladder sorted ascending plus the best bid.
#[derive(Debug, Clone, Default)]
pub struct OrderBookSnapshot {
    pub best_bid: Option<f64>,
    /// `(price, base_qty)` rows, best ask first.
    pub asks: Vec<(f64, f64)>,
}

/// Quote-currency ask depth near the best ask.
#[derive(Debug, Clone, PartialEq)]
pub struct Liquidity {
    /// Best ask, `None` when the ladder is empty.
    pub price: Option<f64>,
    /// Depth within +1 % of the best ask.
    pub liq1: f64,
    /// Depth within +3 % of the best ask.
    pub liq3: f64,
}

impl OrderBookSnapshot {
    /// Sum the quote-currency depth within +1 % and +3 % of the best ask.
    pub fn liquidity(&self) -> Liquidity {
        let Some(&(best, _)) = self.asks.first() else {
            return Liquidity {
                price: None,
                liq1: 0.0,
                liq3: 0.0,
            };
        };

        let mut liq1 = 0.0;
        let mut liq3 = 0.0;
        for &(price, qty) in &self.asks {
            let notional = price * qty;
            if price <= best * 1.01 {
                liq1 += notional;
            }
            if price <= best * 1.03 {
                liq3 += notional;
            }
        }

        Liquidity {
            price: Some(best),
            liq1,
            liq3,
        }
    }

    /// Bid/ask spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> Option<f64> {
        let best_ask = self.asks.first().map(|&(p, _)| p)?;
        let best_bid = self.best_bid?;
        let mid = (best_ask + best_bid) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((best_ask - best_bid) / mid * 100.0)
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Public order-book reader for all supported exchanges.
#[derive(Clone)]
pub struct OrderBookFetcher {
    client: reqwest::Client,
}

impl OrderBookFetcher {
    pub fn new() -> Self {
        Self {
            client: crate::gateway::data_client(),
        }
    }

    /// Fetch the ask ladder for `symbol` on `exchange`.
    pub async fn fetch(&self, exchange: Exchange, symbol: &Symbol) -> Result<OrderBookSnapshot> {
        match exchange {
            Exchange::Okx => self.fetch_okx(symbol).await,
            Exchange::Binance => self.fetch_binance(symbol).await,
            Exchange::Bybit => self.fetch_bybit(symbol).await,
        }
    }

    async fn fetch_okx(&self, symbol: &Symbol) -> Result<OrderBookSnapshot> {
        let url = format!(
            "https://www.okx.com/api/v5/market/books?instId={}&sz={BOOK_DEPTH}",
            symbol.to_okx()
        );
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/market/books request failed")?
            .json()
            .await
            .context("failed to parse OKX book response")?;

        if body["code"].as_str() != Some("0") {
            anyhow::bail!("OKX book read rejected: {body}");
        }
        parse_book(&body["data"][0]["asks"], &body["data"][0]["bids"])
    }

    async fn fetch_binance(&self, symbol: &Symbol) -> Result<OrderBookSnapshot> {
        let url = format!(
            "https://api.binance.com/api/v3/depth?symbol={}&limit={BOOK_DEPTH}",
            symbol.to_binance()
        );
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/depth request failed")?
            .json()
            .await
            .context("failed to parse Binance depth response")?;

        parse_book(&body["asks"], &body["bids"])
    }

    async fn fetch_bybit(&self, symbol: &Symbol) -> Result<OrderBookSnapshot> {
        let url = format!(
            "https://api.bybit.com/v5/market/orderbook?category=spot&symbol={}&limit={BOOK_DEPTH}",
            symbol.to_bybit()
        );
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/orderbook request failed")?
            .json()
            .await
            .context("failed to parse Bybit book response")?;

        if body["retCode"].as_i64() != Some(0) {
            anyhow::bail!("Bybit book read rejected: {body}");
        }
        parse_book(&body["result"]["a"], &body["result"]["b"])
    }
}

impl Default for OrderBookFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderBookFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookFetcher").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `[["price","qty",...], ...]` arrays into an ask ladder plus the best
/// bid. All three exchanges share this row shape; extra row elements (OKX
/// appends order counts) are ignored.
fn parse_book(asks: &serde_json::Value, bids: &serde_json::Value) -> Result<OrderBookSnapshot> {
    let asks = parse_levels(asks).context("missing or malformed asks")?;
    let best_bid = match parse_levels(bids) {
        Ok(levels) => levels.first().map(|&(p, _)| p),
        Err(e) => {
            warn!(error = %e, "book has no parseable bids");
            None
        }
    };
    Ok(OrderBookSnapshot { best_bid, asks })
}

fn parse_levels(value: &serde_json::Value) -> Result<Vec<(f64, f64)>> {
    let rows = value.as_array().context("levels are not an array")?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_array().context("level row is not an array")?;
        if row.len() < 2 {
            anyhow::bail!("level row has fewer than 2 elements");
        }
        let price = parse_str_f64(&row[0])?;
        let qty = parse_str_f64(&row[1])?;
        levels.push((price, qty));
    }
    Ok(levels)
}
