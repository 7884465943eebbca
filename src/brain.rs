// =============================================================================
// Brain — resolves intent signals against the roster and routes by risk
// =============================================================================
//
// One message at a time: the downstream publish for a signal completes before
// the next message is taken, so packet order follows signal order. The Brain
// performs no exchange I/O and never blocks on per-client work — it only
// reads the registry and publishes packets.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::bus::{
    publish_json, Bus, BRAIN_SIGNALS_CHANNEL, CAPTAIN_SIGNALS_CHANNEL, FLEET_COMMAND_CHANNEL,
    SMART_ENTRY_CHANNEL,
};
use crate::dedup::SeenCache;
use crate::registry::ClientRegistry;
use crate::types::{now_ms, Action, DemandPacket, Packet, RiskClass, Signal};

/// Signal resolver and router.
pub struct Brain {
    bus: Arc<dyn Bus>,
    registry: Arc<dyn ClientRegistry>,
    state: Arc<AppState>,
    seen: RwLock<SeenCache>,
}

impl Brain {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<dyn ClientRegistry>, state: Arc<AppState>) -> Self {
        Self {
            bus,
            registry,
            state,
            seen: RwLock::new(SeenCache::default()),
        }
    }

    /// Consume intent signals from both console channels until the bus ends.
    pub async fn run(&self) -> Result<()> {
        let mut captain_rx = self.bus.subscribe(CAPTAIN_SIGNALS_CHANNEL).await?;
        let mut console_rx = self.bus.subscribe(BRAIN_SIGNALS_CHANNEL).await?;
        info!("brain listening for intent signals");

        loop {
            let payload = tokio::select! {
                Some(p) = captain_rx.recv() => p,
                Some(p) = console_rx.recv() => p,
                else => {
                    warn!("all intent channels closed — brain stopping");
                    return Ok(());
                }
            };
            self.handle_raw(&payload).await;
        }
    }

    /// Parse and process one raw bus payload. Malformed signals are dropped
    /// with a warning and never forwarded.
    pub async fn handle_raw(&self, payload: &str) {
        self.state.signals_received.fetch_add(1, Ordering::Relaxed);

        let signal: Signal = match serde_json::from_str(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "malformed signal dropped");
                self.state.signals_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = self.handle_signal(signal).await {
            warn!(error = %e, "signal handling failed");
        }
    }

    /// Resolve, classify, and route one signal.
    pub async fn handle_signal(&self, signal: Signal) -> Result<()> {
        if !self.seen.write().insert(&signal.signal_id) {
            debug!(signal_id = %signal.signal_id, "duplicate signal dropped");
            self.state.signals_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if signal.risk == RiskClass::Unknown {
            warn!(signal_id = %signal.signal_id, "unknown risk class — signal dropped");
            self.state.signals_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if signal.action == Action::Cancel {
            // CANCEL carries no executable demand for the fleet.
            info!(signal_id = %signal.signal_id, "cancel signal dropped");
            self.state.signals_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let settings = self
            .registry
            .captain_settings()
            .await
            .context("failed to read captain settings")?;

        let mut risk = signal.risk;
        if risk == RiskClass::Risky {
            if !settings.risky_mode_enabled {
                warn!(signal_id = %signal.signal_id, "risky mode disabled — signal dropped");
                self.state.signals_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if !settings.smart_entry_enabled {
                info!(
                    signal_id = %signal.signal_id,
                    "smart entry disabled — routing risky signal as normal"
                );
                risk = RiskClass::Normal;
            }
        }

        let Some(packet) = self.resolve(&signal).await? else {
            info!(signal_id = %signal.signal_id, "no eligible clients — signal dropped");
            return Ok(());
        };

        match risk {
            RiskClass::Normal => {
                publish_json(
                    self.bus.as_ref(),
                    FLEET_COMMAND_CHANNEL,
                    &Packet::Normal(packet),
                )
                .await?;
                self.state.packets_normal.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal_id = %signal.signal_id,
                    symbol = %signal.symbol,
                    action = %signal.action,
                    "normal demand published"
                );
            }
            RiskClass::Risky => {
                publish_json(
                    self.bus.as_ref(),
                    SMART_ENTRY_CHANNEL,
                    &Packet::Risky(packet),
                )
                .await?;
                self.state.packets_risky.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal_id = %signal.signal_id,
                    symbol = %signal.symbol,
                    action = %signal.action,
                    "risky demand routed to smart entry"
                );
            }
            RiskClass::Unknown => unreachable!("unknown risk rejected above"),
        }

        Ok(())
    }

    /// Turn a signal into per-exchange demand across the eligible roster.
    async fn resolve(&self, signal: &Signal) -> Result<Option<DemandPacket>> {
        let clients = self
            .registry
            .eligible_clients()
            .await
            .context("failed to enumerate eligible clients")?;

        let mut per_exchange: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for client in &clients {
            let usd = client.usd_to_commit();
            if usd <= 0.0 {
                continue;
            }
            per_exchange
                .entry(client.exchange.as_str().to_string())
                .or_default()
                .insert(client.client_id.clone(), usd);
        }

        if per_exchange.is_empty() {
            return Ok(None);
        }

        Ok(Some(DemandPacket {
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            action: signal.action,
            per_exchange,
            timestamp: now_ms(),
        }))
    }
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("seen", &self.seen.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::registry::{CaptainSettings, ClientRecord, FileRegistry};
    use crate::symbol::Symbol;
    use crate::types::{Exchange, SignalSource};

    fn client(id: &str, exchange: Exchange, balance: f64, allocation: f64) -> ClientRecord {
        ClientRecord {
            client_id: id.to_string(),
            exchange,
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            extra_password: None,
            balance_usdt: balance,
            allocation,
            spread_limit: 1.0,
            active: true,
            approved: true,
            created_at: None,
        }
    }

    fn signal(id: &str, risk: RiskClass) -> Signal {
        Signal {
            signal_id: id.to_string(),
            symbol: Symbol::parse("ETH/USDT").unwrap(),
            action: Action::Buy,
            risk,
            source: SignalSource::CaptainConsole,
            usd: None,
            price: None,
            timestamp: now_ms(),
        }
    }

    fn harness() -> (Brain, Arc<MemoryBus>, Arc<FileRegistry>) {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(FileRegistry::empty());
        let state = Arc::new(AppState::new());
        let brain = Brain::new(bus.clone(), registry.clone(), state);
        (brain, bus, registry)
    }

    #[tokio::test]
    async fn normal_signal_resolves_per_exchange_demand() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        registry.upsert(client("u2", Exchange::Binance, 500.0, 20.0));
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Normal))
            .await
            .unwrap();

        let payload = fleet.recv().await.unwrap();
        match serde_json::from_str::<Packet>(&payload).unwrap() {
            Packet::Normal(p) => {
                assert_eq!(p.signal_id, "s1");
                assert_eq!(p.per_exchange.len(), 2);
                assert!((p.per_exchange["okx"]["u1"] - 100.0).abs() < 1e-9);
                assert!((p.per_exchange["binance"]["u2"] - 100.0).abs() < 1e-9);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_signal_id_publishes_once() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Normal))
            .await
            .unwrap();
        brain
            .handle_signal(signal("s1", RiskClass::Normal))
            .await
            .unwrap();

        assert!(fleet.recv().await.is_some());
        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn risky_signal_routes_to_smart_entry() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        let mut entry = bus.subscribe(SMART_ENTRY_CHANNEL).await.unwrap();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Risky))
            .await
            .unwrap();

        let payload = entry.recv().await.unwrap();
        assert!(matches!(
            serde_json::from_str::<Packet>(&payload).unwrap(),
            Packet::Risky(_)
        ));
        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn risky_signal_downgrades_when_smart_entry_disabled() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        registry.set_settings(CaptainSettings {
            smart_entry_enabled: false,
            ..CaptainSettings::default()
        });
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Risky))
            .await
            .unwrap();

        let payload = fleet.recv().await.unwrap();
        assert!(matches!(
            serde_json::from_str::<Packet>(&payload).unwrap(),
            Packet::Normal(_)
        ));
    }

    #[tokio::test]
    async fn risky_signal_dropped_when_risky_mode_disabled() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        registry.set_settings(CaptainSettings {
            risky_mode_enabled: false,
            ..CaptainSettings::default()
        });
        let mut entry = bus.subscribe(SMART_ENTRY_CHANNEL).await.unwrap();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Risky))
            .await
            .unwrap();

        assert!(entry.try_recv().is_err());
        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_risk_and_cancel_are_dropped() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Unknown))
            .await
            .unwrap();

        let mut cancel = signal("s2", RiskClass::Normal);
        cancel.action = Action::Cancel;
        brain.handle_signal(cancel).await.unwrap();

        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_eligible_clients_publishes_nothing() {
        let (brain, bus, _registry) = harness();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain
            .handle_signal(signal("s1", RiskClass::Normal))
            .await
            .unwrap();

        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_and_dropped() {
        let (brain, bus, registry) = harness();
        registry.upsert(client("u1", Exchange::Okx, 1000.0, 10.0));
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        brain.handle_raw("{not json").await;
        brain
            .handle_raw(r#"{"signal_id":"s1","risk":"NORMAL"}"#)
            .await;

        assert!(fleet.try_recv().is_err());
        assert_eq!(brain.state.signals_dropped.load(Ordering::Relaxed), 2);
    }
}
