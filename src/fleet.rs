// =============================================================================
// Fleet Executor — parallel per-client order dispatch over the Soldiers
// =============================================================================
//
// Consumes execution packets and fans each one out across its clients. All
// orders in a packet launch concurrently under a semaphore cap; the executor
// waits for every order to settle, and one client's failure never cancels
// another's order. Results are logged and recorded but never aggregated back
// to the publisher, and nothing is retried.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertPublisher};
use crate::app_state::AppState;
use crate::bus::{Bus, FLEET_COMMAND_CHANNEL};
use crate::config::FLEET_DISPATCH_CAP;
use crate::registry::ClientRegistry;
use crate::soldier::SoldierRegistry;
use crate::symbol::Symbol;
use crate::types::{
    Action, DemandPacket, Exchange, ExecutionRecord, ExecutionStatus, Packet, WavePacket,
};

/// One per-client order to place.
struct DispatchJob {
    exchange: Exchange,
    client_id: String,
    usd: f64,
}

/// Parallel execution dispatcher fed by the fleet-command channel.
pub struct FleetExecutor {
    bus: Arc<dyn Bus>,
    registry: Arc<dyn ClientRegistry>,
    soldiers: Arc<SoldierRegistry>,
    state: Arc<AppState>,
    alerts: Arc<AlertPublisher>,
}

impl FleetExecutor {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<dyn ClientRegistry>,
        soldiers: Arc<SoldierRegistry>,
        state: Arc<AppState>,
        alerts: Arc<AlertPublisher>,
    ) -> Self {
        Self {
            bus,
            registry,
            soldiers,
            state,
            alerts,
        }
    }

    /// Consume execution packets until the bus ends.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self.bus.subscribe(FLEET_COMMAND_CHANNEL).await?;
        info!("fleet executor listening");

        while let Some(payload) = rx.recv().await {
            self.handle_raw(&payload).await;
        }
        warn!("fleet command channel closed — executor stopping");
        Ok(())
    }

    pub async fn handle_raw(&self, payload: &str) {
        match serde_json::from_str::<Packet>(payload) {
            Ok(Packet::Normal(packet)) => self.dispatch_demand(packet).await,
            Ok(Packet::SmartWave(wave)) => self.dispatch_wave(wave).await,
            Ok(Packet::Risky(packet)) => {
                warn!(
                    signal_id = %packet.signal_id,
                    "risky packet on fleet channel — ignored (belongs on smart entry)"
                );
            }
            Err(e) => {
                warn!(error = %e, "malformed packet on fleet channel");
            }
        }
    }

    /// NORMAL packet: every (exchange, client, usd) entry in parallel.
    pub async fn dispatch_demand(&self, packet: DemandPacket) {
        let mut jobs = Vec::new();
        for (name, clients) in &packet.per_exchange {
            let Some(exchange) = Exchange::parse(name) else {
                warn!(exchange = %name, signal_id = %packet.signal_id, "unknown exchange in packet — skipping");
                continue;
            };
            for (client_id, usd) in clients {
                jobs.push(DispatchJob {
                    exchange,
                    client_id: client_id.clone(),
                    usd: *usd,
                });
            }
        }

        info!(
            signal_id = %packet.signal_id,
            action = %packet.action,
            orders = jobs.len(),
            "dispatching normal packet"
        );
        self.dispatch_jobs(&packet.symbol, packet.action, jobs).await;
    }

    /// SMART_WAVE packet: one exchange, zero amounts skipped.
    pub async fn dispatch_wave(&self, wave: WavePacket) {
        let Some(exchange) = Exchange::parse(&wave.exchange) else {
            warn!(exchange = %wave.exchange, signal_id = %wave.signal_id, "unknown exchange in wave — skipping");
            return;
        };

        let jobs: Vec<DispatchJob> = wave
            .per_client_amount_usd
            .iter()
            .filter(|(_, usd)| **usd > 0.0)
            .map(|(client_id, usd)| DispatchJob {
                exchange,
                client_id: client_id.clone(),
                usd: *usd,
            })
            .collect();

        info!(
            signal_id = %wave.signal_id,
            wave_index = wave.wave_index,
            orders = jobs.len(),
            "dispatching wave"
        );
        self.dispatch_jobs(&wave.symbol, wave.action, jobs).await;
    }

    /// Launch every job concurrently (bounded by the semaphore), wait for all
    /// of them to settle, then record and alert on each outcome.
    async fn dispatch_jobs(&self, symbol: &Symbol, action: Action, jobs: Vec<DispatchJob>) {
        let semaphore = Semaphore::new(FLEET_DISPATCH_CAP);

        let futures = jobs.into_iter().map(|job| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("dispatch semaphore never closes");
                self.execute_one(job, symbol, action).await
            }
        });
        let records: Vec<Option<ExecutionRecord>> = join_all(futures).await;

        for record in records.into_iter().flatten() {
            match record.status {
                ExecutionStatus::Executed => {
                    self.state.orders_executed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        client_id = %record.client_id,
                        symbol = %record.symbol,
                        exchange = %record.exchange,
                        amount = record.amount,
                        reason = record.reason.as_deref().unwrap_or("-"),
                        "order executed"
                    );
                    let alert =
                        Alert::entry(&record.client_id, symbol, record.amount, &record.exchange);
                    if let Err(e) = self.alerts.emit(alert).await {
                        warn!(error = %e, "entry alert publish failed");
                    }
                }
                ExecutionStatus::Failed => {
                    self.state.orders_failed.fetch_add(1, Ordering::Relaxed);
                    let reason = record.reason.clone().unwrap_or_else(|| "unknown".to_string());
                    warn!(
                        client_id = %record.client_id,
                        symbol = %record.symbol,
                        exchange = %record.exchange,
                        reason = %reason,
                        "order failed"
                    );
                    let alert = Alert::fail(
                        &record.client_id,
                        symbol,
                        record.amount,
                        &record.exchange,
                        &reason,
                    );
                    if let Err(e) = self.alerts.emit(alert).await {
                        warn!(error = %e, "fail alert publish failed");
                    }
                }
            }
            self.state.push_execution(record);
        }
    }

    /// Place one client's order. Credentials are read from the registry at
    /// dispatch time, never cached across signals.
    async fn execute_one(
        &self,
        job: DispatchJob,
        symbol: &Symbol,
        action: Action,
    ) -> Option<ExecutionRecord> {
        let exchange_name = job.exchange.as_str();

        if action == Action::Cancel {
            warn!(client_id = %job.client_id, "cancel action reached the fleet — skipped");
            return None;
        }

        let Some(soldier) = self.soldiers.get(job.exchange) else {
            return Some(ExecutionRecord::new(
                &job.client_id,
                symbol,
                job.usd,
                exchange_name,
                ExecutionStatus::Failed,
                Some(format!("no soldier registered for {exchange_name}")),
            ));
        };

        let client = match self.registry.client(&job.client_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return Some(ExecutionRecord::new(
                    &job.client_id,
                    symbol,
                    job.usd,
                    exchange_name,
                    ExecutionStatus::Failed,
                    Some("client not found in registry".to_string()),
                ));
            }
            Err(e) => {
                return Some(ExecutionRecord::new(
                    &job.client_id,
                    symbol,
                    job.usd,
                    exchange_name,
                    ExecutionStatus::Failed,
                    Some(format!("registry read failed: {e:#}")),
                ));
            }
        };

        let creds = client.credentials();
        let report = match action {
            Action::Buy => soldier.market_buy(&creds, symbol, job.usd).await,
            Action::Sell => soldier.market_sell(&creds, symbol, job.usd).await,
            Action::Close => soldier.close_position(&creds, symbol).await,
            Action::Cancel => unreachable!("cancel rejected above"),
        };

        Some(ExecutionRecord::new(
            &job.client_id,
            symbol,
            job.usd,
            exchange_name,
            report.status,
            report.reason,
        ))
    }
}

impl std::fmt::Debug for FleetExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetExecutor")
            .field("soldiers", &self.soldiers)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::bus::{MemoryBus, ALERT_FEED_CHANNEL};
    use crate::gateway::Credentials;
    use crate::registry::{CaptainSettings, ClientRecord, FileRegistry};
    use crate::soldier::{Soldier, SoldierReport, NOTHING_TO_CLOSE};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Test soldier: fails any client whose api key matches `fail_key`, and
    /// reports nothing-to-close on close when `empty_close` is set.
    struct MockSoldier {
        exchange: Exchange,
        fail_key: Option<String>,
        empty_close: bool,
    }

    #[async_trait]
    impl Soldier for MockSoldier {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn market_buy(&self, creds: &Credentials, _: &Symbol, _: f64) -> SoldierReport {
            if Some(&creds.api_key) == self.fail_key.as_ref() {
                SoldierReport::failed("exchange rejected order".to_string())
            } else {
                SoldierReport::executed(serde_json::json!({"orderId": 1}))
            }
        }

        async fn market_sell(&self, creds: &Credentials, sym: &Symbol, usd: f64) -> SoldierReport {
            self.market_buy(creds, sym, usd).await
        }

        async fn close_position(&self, _: &Credentials, _: &Symbol) -> SoldierReport {
            if self.empty_close {
                SoldierReport::executed_with_reason(NOTHING_TO_CLOSE)
            } else {
                SoldierReport::executed(serde_json::json!({"orderId": 2}))
            }
        }
    }

    fn client(id: &str, exchange: Exchange) -> ClientRecord {
        ClientRecord {
            client_id: id.to_string(),
            exchange,
            api_key: format!("key-{id}"),
            api_secret: "s".to_string(),
            extra_password: None,
            balance_usdt: 1000.0,
            allocation: 10.0,
            spread_limit: 1.0,
            active: true,
            approved: true,
            created_at: None,
        }
    }

    fn harness(soldier: MockSoldier) -> (FleetExecutor, Arc<MemoryBus>, Arc<FileRegistry>, Arc<AppState>) {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(FileRegistry::empty());
        let state = Arc::new(AppState::new());
        let alerts = Arc::new(AlertPublisher::new(
            bus.clone(),
            registry.clone(),
            state.clone(),
        ));
        let mut soldiers = SoldierRegistry::empty();
        soldiers.register(Arc::new(soldier));
        let fleet = FleetExecutor::new(
            bus.clone(),
            registry.clone(),
            Arc::new(soldiers),
            state.clone(),
            alerts,
        );
        (fleet, bus, registry, state)
    }

    fn normal_packet(clients: &[(&str, f64)]) -> DemandPacket {
        let mut okx = HashMap::new();
        for (id, usd) in clients {
            okx.insert(id.to_string(), *usd);
        }
        let mut per_exchange = HashMap::new();
        per_exchange.insert("okx".to_string(), okx);
        DemandPacket {
            signal_id: "s1".to_string(),
            symbol: Symbol::parse("ETH/USDT").unwrap(),
            action: Action::Buy,
            per_exchange,
            timestamp: crate::types::now_ms(),
        }
    }

    #[tokio::test]
    async fn one_failing_client_does_not_affect_the_others() {
        let (fleet, _bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: Some("key-u2".to_string()),
            empty_close: false,
        });
        for id in ["u1", "u2", "u3"] {
            registry.upsert(client(id, Exchange::Okx));
        }

        fleet
            .dispatch_demand(normal_packet(&[("u1", 100.0), ("u2", 100.0), ("u3", 100.0)]))
            .await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 3);
        let status_of = |id: &str| {
            records
                .iter()
                .find(|r| r.client_id == id)
                .map(|r| r.status)
                .unwrap()
        };
        assert_eq!(status_of("u1"), ExecutionStatus::Executed);
        assert_eq!(status_of("u2"), ExecutionStatus::Failed);
        assert_eq!(status_of("u3"), ExecutionStatus::Executed);
        assert_eq!(state.orders_executed.load(Ordering::Relaxed), 2);
        assert_eq!(state.orders_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn close_with_nothing_to_sell_is_success_without_fail_alert() {
        let (fleet, bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: true,
        });
        registry.upsert(client("u1", Exchange::Okx));
        let mut feed = bus.subscribe(ALERT_FEED_CHANNEL).await.unwrap();

        let mut packet = normal_packet(&[("u1", 100.0)]);
        packet.action = Action::Close;
        fleet.dispatch_demand(packet).await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Executed);
        assert_eq!(records[0].reason.as_deref(), Some(NOTHING_TO_CLOSE));

        // The only alert on the feed is the entry record, never a fail.
        let alert: Alert = serde_json::from_str(&feed.recv().await.unwrap()).unwrap();
        assert_eq!(alert.kind, AlertKind::Entry);
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn suppressed_entry_alert_still_writes_the_execution_record() {
        let (fleet, bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        });
        registry.upsert(client("u1", Exchange::Okx));
        registry.set_settings(CaptainSettings {
            alert_entry: false,
            ..CaptainSettings::default()
        });
        let mut feed = bus.subscribe(ALERT_FEED_CHANNEL).await.unwrap();

        fleet.dispatch_demand(normal_packet(&[("u1", 100.0)])).await;

        assert!(feed.try_recv().is_err());
        assert_eq!(state.recent_executions.read().len(), 1);
        assert_eq!(state.orders_executed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn wave_dispatch_skips_zero_amounts() {
        let (fleet, _bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        });
        registry.upsert(client("u1", Exchange::Okx));
        registry.upsert(client("u2", Exchange::Okx));

        let wave = WavePacket {
            signal_id: "s1_w0_okx".to_string(),
            parent: "s1".to_string(),
            symbol: Symbol::parse("ETH/USDT").unwrap(),
            action: Action::Buy,
            exchange: "okx".to_string(),
            wave_index: 0,
            per_client_amount_usd: HashMap::from([
                ("u1".to_string(), 50.0),
                ("u2".to_string(), 0.0),
            ]),
            timestamp: crate::types::now_ms(),
        };
        fleet.dispatch_wave(wave).await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client_id, "u1");
    }

    #[tokio::test]
    async fn unknown_exchange_entries_are_skipped_not_fatal() {
        let (fleet, _bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        });
        registry.upsert(client("u1", Exchange::Okx));

        let mut packet = normal_packet(&[("u1", 100.0)]);
        packet.per_exchange.insert(
            "kraken".to_string(),
            HashMap::from([("u9".to_string(), 100.0)]),
        );
        fleet.dispatch_demand(packet).await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client_id, "u1");
    }

    #[tokio::test]
    async fn brain_resolved_demand_executes_across_exchanges() {
        // End to end over the in-memory bus: one NORMAL signal, two clients
        // on different exchanges, two parallel market buys.
        let (fleet, bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        });
        // The harness only registers the OKX soldier; add a Binance one.
        let mut soldiers = SoldierRegistry::empty();
        soldiers.register(Arc::new(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        }));
        soldiers.register(Arc::new(MockSoldier {
            exchange: Exchange::Binance,
            fail_key: None,
            empty_close: false,
        }));
        let fleet = FleetExecutor::new(
            fleet.bus.clone(),
            registry.clone(),
            Arc::new(soldiers),
            state.clone(),
            fleet.alerts.clone(),
        );

        let mut u1 = client("u1", Exchange::Okx);
        u1.balance_usdt = 1000.0;
        u1.allocation = 10.0;
        let mut u2 = client("u2", Exchange::Binance);
        u2.balance_usdt = 500.0;
        u2.allocation = 20.0;
        registry.upsert(u1);
        registry.upsert(u2);

        let brain = crate::brain::Brain::new(bus.clone(), registry.clone(), state.clone());
        let mut fleet_rx = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();
        let signal: crate::types::Signal = serde_json::from_str(
            r#"{"signal_id":"s1","symbol":"ETH/USDT","action":"BUY","risk":"NORMAL","usd":0}"#,
        )
        .unwrap();
        brain.handle_signal(signal).await.unwrap();

        let payload = fleet_rx.recv().await.unwrap();
        fleet.handle_raw(&payload).await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 2);
        let amount_of = |id: &str| {
            records
                .iter()
                .find(|r| r.client_id == id)
                .map(|r| r.amount)
                .unwrap()
        };
        assert!((amount_of("u1") - 100.0).abs() < 1e-9);
        assert!((amount_of("u2") - 100.0).abs() < 1e-9);
        assert!(records.iter().all(|r| r.status == ExecutionStatus::Executed));
    }

    #[tokio::test]
    async fn missing_client_record_fails_only_that_order() {
        let (fleet, _bus, registry, state) = harness(MockSoldier {
            exchange: Exchange::Okx,
            fail_key: None,
            empty_close: false,
        });
        registry.upsert(client("u1", Exchange::Okx));

        fleet
            .dispatch_demand(normal_packet(&[("u1", 100.0), ("ghost", 100.0)]))
            .await;

        let records = state.recent_executions.read().clone();
        assert_eq!(records.len(), 2);
        let ghost = records.iter().find(|r| r.client_id == "ghost").unwrap();
        assert_eq!(ghost.status, ExecutionStatus::Failed);
        assert!(ghost.reason.as_deref().unwrap().contains("not found"));
    }
}
