// =============================================================================
// Eye — authenticated observer of the captain's live OKX fills
// =============================================================================
//
// Long-lived private websocket on the captain's account. Every observed fill
// becomes exactly one intent signal on the captain-signals channel: fills are
// deduplicated by exchange order id against a bounded cache that survives
// reconnects, so a replayed frame after a reconnect never publishes twice.
//
// State machine: Disconnected -> Authenticating -> Subscribed -> Listening,
// any failure returning to Disconnected after a backoff. Login rejection is
// fatal; the supervisor owns the restart.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::bus::{publish_json, Bus, CAPTAIN_SIGNALS_CHANNEL};
use crate::config::{WS_IDLE_TIMEOUT_SECS, WS_RECONNECT_BACKOFF_SECS};
use crate::dedup::SeenCache;
use crate::gateway::Credentials;
use crate::symbol::Symbol;
use crate::types::{now_ms, Action, RiskClass, Signal, SignalSource};

type HmacSha256 = Hmac<Sha256>;

/// Connection lifecycle of the Eye, surfaced in the state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EyeConnectionState {
    Disconnected,
    Authenticating,
    Subscribed,
    Listening,
}

/// Login rejection from the exchange. Fatal: reconnecting with the same
/// credentials would only be rejected again.
#[derive(Debug)]
pub struct AuthFailure(pub String);

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "captain websocket login rejected: {}", self.0)
    }
}

impl std::error::Error for AuthFailure {}

/// Captain observer: one instance per process, restarted by the supervisor.
pub struct Eye {
    bus: Arc<dyn Bus>,
    state: Arc<AppState>,
    creds: Credentials,
    ws_url: String,
    /// SeenFills — retained across reconnects for at-most-once publishing.
    seen: RwLock<SeenCache>,
}

impl Eye {
    pub fn new(bus: Arc<dyn Bus>, state: Arc<AppState>, creds: Credentials, ws_url: String) -> Self {
        Self {
            bus,
            state,
            creds,
            ws_url,
            seen: RwLock::new(SeenCache::default()),
        }
    }

    /// Run forever, reconnecting with backoff on any transport error. Only an
    /// authentication rejection ends the loop.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_session().await {
                Err(e) if e.downcast_ref::<AuthFailure>().is_some() => {
                    self.state.set_eye_state(EyeConnectionState::Disconnected);
                    error!(error = %e, "eye authentication failed — aborting for supervisor restart");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "captain websocket session failed");
                }
                Ok(()) => {
                    warn!("captain websocket stream ended");
                }
            }
            self.state.set_eye_state(EyeConnectionState::Disconnected);
            tokio::time::sleep(std::time::Duration::from_secs(WS_RECONNECT_BACKOFF_SECS)).await;
        }
    }

    /// One connect/login/subscribe/listen cycle.
    async fn run_session(&self) -> Result<()> {
        self.state.set_eye_state(EyeConnectionState::Authenticating);
        info!(url = %self.ws_url, "connecting captain websocket");

        let (ws_stream, _response) = connect_async(&self.ws_url)
            .await
            .context("failed to connect captain websocket")?;
        let (mut write, mut read) = ws_stream.split();

        // ── Login ───────────────────────────────────────────────────────
        let login = login_frame(&self.creds);
        write
            .send(Message::Text(login.to_string()))
            .await
            .context("failed to send login frame")?;

        loop {
            let frame = tokio::time::timeout(
                std::time::Duration::from_secs(WS_IDLE_TIMEOUT_SECS),
                read.next(),
            )
            .await
            .context("timed out waiting for login response")?
            .context("websocket closed during login")?
            .context("websocket error during login")?;

            let Message::Text(text) = frame else { continue };
            let v: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match v["event"].as_str() {
                Some("login") if v["code"].as_str() == Some("0") => break,
                Some("login") | Some("error") => {
                    return Err(anyhow::Error::new(AuthFailure(text)));
                }
                _ => continue,
            }
        }
        info!("captain websocket authenticated");
        self.state.set_eye_state(EyeConnectionState::Subscribed);

        // ── Subscribe to the captain's order updates ────────────────────
        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": [{"channel": "orders", "instType": "SPOT"}],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send subscribe frame")?;
        self.state.set_eye_state(EyeConnectionState::Listening);
        info!("listening for captain fills");

        // ── Listen ──────────────────────────────────────────────────────
        let mut idle_strikes: u32 = 0;
        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_secs(WS_IDLE_TIMEOUT_SECS),
                read.next(),
            )
            .await;

            match next {
                Err(_) => {
                    idle_strikes += 1;
                    if idle_strikes >= 2 {
                        anyhow::bail!("captain websocket silent — reconnecting");
                    }
                    debug!("no frame within idle window — pinging");
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("failed to send ping")?;
                }
                Ok(None) => anyhow::bail!("captain websocket stream ended"),
                Ok(Some(Err(e))) => {
                    return Err(e).context("captain websocket read error");
                }
                Ok(Some(Ok(msg))) => {
                    idle_strikes = 0;
                    if let Message::Text(text) = msg {
                        if text == "pong" {
                            continue;
                        }
                        self.handle_frame(&text).await;
                    }
                }
            }
        }
    }

    /// Extract fills from one frame and publish each unseen one exactly once.
    pub async fn handle_frame(&self, text: &str) {
        let fills = match parse_fills(text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "frame carried no fills");
                return;
            }
        };

        for (ord_id, signal) in fills {
            if !self.seen.write().insert(&ord_id) {
                debug!(ord_id = %ord_id, "fill already forwarded — dropped");
                continue;
            }

            info!(
                ord_id = %ord_id,
                symbol = %signal.symbol,
                action = %signal.action,
                "captain fill observed"
            );
            if let Err(e) = publish_json(self.bus.as_ref(), CAPTAIN_SIGNALS_CHANNEL, &signal).await
            {
                warn!(ord_id = %ord_id, error = %e, "captain signal publish failed");
            }
        }
    }
}

impl std::fmt::Debug for Eye {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eye")
            .field("ws_url", &self.ws_url)
            .field("seen", &self.seen.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Build the OKX private login frame:
/// `sign = base64(HMAC-SHA256(secret, ts + "GET" + "/users/self/verify"))`.
fn login_frame(creds: &Credentials) -> serde_json::Value {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let sign = login_sign(&creds.api_secret, &timestamp);
    serde_json::json!({
        "op": "login",
        "args": [{
            "apiKey": creds.api_key,
            "passphrase": creds.passphrase.clone().unwrap_or_default(),
            "timestamp": timestamp,
            "sign": sign,
        }],
    })
}

fn login_sign(secret: &str, timestamp: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b"GET");
    mac.update(b"/users/self/verify");
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Parse an `orders` channel frame into `(ordId, signal)` pairs. A row is a
/// fill iff its `fillSz` is present and non-empty.
fn parse_fills(text: &str) -> Result<Vec<(String, Signal)>> {
    let frame: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;
    let rows = frame["data"].as_array().context("frame has no data array")?;

    let mut fills = Vec::new();
    for row in rows {
        let fill_sz = row["fillSz"].as_str().unwrap_or("");
        if fill_sz.is_empty() {
            continue;
        }

        let Some(ord_id) = row["ordId"].as_str() else {
            warn!("fill row missing ordId — skipped");
            continue;
        };
        let Some(inst_id) = row["instId"].as_str() else {
            warn!(ord_id = %ord_id, "fill row missing instId — skipped");
            continue;
        };
        let symbol = match Symbol::from_okx(inst_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(ord_id = %ord_id, error = %e, "unparseable instId — skipped");
                continue;
            }
        };
        let action = match row["side"].as_str() {
            Some("buy") => Action::Buy,
            Some("sell") => Action::Sell,
            other => {
                warn!(ord_id = %ord_id, side = ?other, "unexpected fill side — skipped");
                continue;
            }
        };
        let price = row["fillPx"].as_str().and_then(|s| s.parse::<f64>().ok());

        fills.push((
            ord_id.to_string(),
            Signal {
                signal_id: format!("captain_{ord_id}"),
                symbol,
                action,
                risk: RiskClass::Normal,
                source: SignalSource::CaptainEye,
                usd: None,
                price,
                timestamp: now_ms(),
            },
        ));
    }

    Ok(fills)
}
