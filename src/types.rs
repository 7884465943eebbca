// =============================================================================
// Shared wire types used across the Horus Nexus signal pipeline
// =============================================================================
//
// Every message that crosses a bus channel is UTF-8 JSON with the field names
// defined here. Exchange keys inside packets stay plain strings so that a
// packet mentioning an exchange we do not support still deserialises; the
// consumer skips the foreign key with a warning instead of dropping the whole
// packet.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

/// The spot exchanges the fleet can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Okx,
    Binance,
    Bybit,
}

impl Exchange {
    /// Wire name used as a map key inside demand and wave packets.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Okx => "okx",
            Self::Binance => "binance",
            Self::Bybit => "bybit",
        }
    }

    /// Parse a wire name. Returns `None` for exchanges we do not support so
    /// the caller can skip them (UnknownExchange policy).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "okx" => Some(Self::Okx),
            "binance" => Some(Self::Binance),
            "bybit" => Some(Self::Bybit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Trading instruction carried by a signal, before client fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Close,
    Cancel,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Close => write!(f, "CLOSE"),
            Self::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// Risk classification of a signal. Anything other than NORMAL or RISKY on
/// the wire maps to `Unknown`, which the Brain logs and drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RiskClass {
    Normal,
    Risky,
    Unknown,
}

impl From<String> for RiskClass {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Self::Normal,
            "RISKY" => Self::Risky,
            _ => Self::Unknown,
        }
    }
}

impl From<RiskClass> for String {
    fn from(r: RiskClass) -> Self {
        match r {
            RiskClass::Normal => "NORMAL".to_string(),
            RiskClass::Risky => "RISKY".to_string(),
            RiskClass::Unknown => "UNKNOWN".to_string(),
        }
    }
}

/// Where a signal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    CaptainConsole,
    CaptainEye,
}

impl Default for SignalSource {
    fn default() -> Self {
        Self::CaptainConsole
    }
}

/// A trading intent from the captain, before resolution against the roster.
///
/// `signal_id` is unique and idempotent: the Brain drops duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: Symbol,
    pub action: Action,
    pub risk: RiskClass,
    #[serde(default)]
    pub source: SignalSource,
    #[serde(default)]
    pub usd: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "now_ms")]
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Post-resolution record of how much USD each client commits per exchange.
///
/// Invariant: every referenced client was eligible at resolution time and
/// every amount is positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandPacket {
    pub signal_id: String,
    pub symbol: Symbol,
    pub action: Action,
    /// exchange name -> (client_id -> usd amount)
    pub per_exchange: HashMap<String, HashMap<String, f64>>,
    pub timestamp: i64,
}

impl DemandPacket {
    /// Total USD demand across all exchanges and clients.
    pub fn total_demand(&self) -> f64 {
        self.per_exchange
            .values()
            .flat_map(|clients| clients.values())
            .sum()
    }
}

/// One slice of a risky entry on a single exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavePacket {
    /// `"{parent}_w{wave_index}_{exchange}"` — unique per wave.
    pub signal_id: String,
    pub parent: String,
    pub symbol: Symbol,
    pub action: Action,
    pub exchange: String,
    pub wave_index: u32,
    pub per_client_amount_usd: HashMap<String, f64>,
    pub timestamp: i64,
}

impl WavePacket {
    pub fn wave_id(parent: &str, wave_index: u32, exchange: &str) -> String {
        format!("{parent}_w{wave_index}_{exchange}")
    }
}

/// Every packet kind that crosses the fleet-command and smart-entry channels,
/// discriminated by the `type` field on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "NORMAL")]
    Normal(DemandPacket),
    #[serde(rename = "RISKY")]
    Risky(DemandPacket),
    #[serde(rename = "SMART_WAVE")]
    SmartWave(WavePacket),
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Outcome of one per-client order attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executed,
    Failed,
}

/// Log record produced for every dispatched per-client order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub client_id: String,
    pub symbol: Symbol,
    pub amount: f64,
    #[serde(default)]
    pub price: Option<f64>,
    pub exchange: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub time: String,
}

impl ExecutionRecord {
    pub fn new(
        client_id: &str,
        symbol: &Symbol,
        amount: f64,
        exchange: &str,
        status: ExecutionStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            symbol: symbol.clone(),
            amount,
            price: None,
            exchange: exchange.to_string(),
            status,
            reason,
            time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_class_unknown_values_map_to_unknown() {
        let s: Signal = serde_json::from_str(
            r#"{"signal_id":"s1","symbol":"BTC/USDT","action":"BUY","risk":"YOLO"}"#,
        )
        .unwrap();
        assert_eq!(s.risk, RiskClass::Unknown);
    }

    #[test]
    fn signal_missing_action_is_malformed() {
        let res = serde_json::from_str::<Signal>(
            r#"{"signal_id":"s1","symbol":"BTC/USDT","risk":"NORMAL"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn signal_defaults_fill_optional_fields() {
        let s: Signal = serde_json::from_str(
            r#"{"signal_id":"s1","symbol":"ETH/USDT","action":"SELL","risk":"NORMAL"}"#,
        )
        .unwrap();
        assert_eq!(s.source, SignalSource::CaptainConsole);
        assert!(s.usd.is_none());
        assert!(s.price.is_none());
        assert!(s.timestamp > 0);
    }

    #[test]
    fn packet_tag_round_trip() {
        let mut clients = HashMap::new();
        clients.insert("u1".to_string(), 100.0);
        let mut per_exchange = HashMap::new();
        per_exchange.insert("okx".to_string(), clients);

        let packet = Packet::Normal(DemandPacket {
            signal_id: "s1".to_string(),
            symbol: Symbol::parse("ETH/USDT").unwrap(),
            action: Action::Buy,
            per_exchange,
            timestamp: now_ms(),
        });

        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains(r#""type":"NORMAL""#));

        match serde_json::from_str::<Packet>(&json).unwrap() {
            Packet::Normal(p) => {
                assert_eq!(p.signal_id, "s1");
                assert_eq!(p.per_exchange["okx"]["u1"], 100.0);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn wave_packet_id_combines_parent_index_exchange() {
        assert_eq!(WavePacket::wave_id("s7", 2, "bybit"), "s7_w2_bybit");
    }

    #[test]
    fn exchange_parse_rejects_foreign_names() {
        assert_eq!(Exchange::parse("okx"), Some(Exchange::Okx));
        assert_eq!(Exchange::parse("BINANCE"), Some(Exchange::Binance));
        assert_eq!(Exchange::parse("kraken"), None);
    }

    #[test]
    fn demand_packet_total_sums_all_clients() {
        let mut okx = HashMap::new();
        okx.insert("u1".to_string(), 100.0);
        okx.insert("u2".to_string(), 250.0);
        let mut binance = HashMap::new();
        binance.insert("u3".to_string(), 50.0);
        let mut per_exchange = HashMap::new();
        per_exchange.insert("okx".to_string(), okx);
        per_exchange.insert("binance".to_string(), binance);

        let packet = DemandPacket {
            signal_id: "s1".to_string(),
            symbol: Symbol::parse("BTC/USDT").unwrap(),
            action: Action::Buy,
            per_exchange,
            timestamp: 0,
        };
        assert!((packet.total_demand() - 400.0).abs() < f64::EPSILON);
    }
}
