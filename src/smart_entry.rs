// =============================================================================
// Smart Entry Engine — liquidity-aware wave planner for risky demand
// =============================================================================
//
// For each exchange in a RISKY demand packet the engine reads the ask ladder,
// sizes the entry against near-top-of-book depth, and splits it into weighted
// waves. Exchanges with an unreachable book, an unknown name, or a spread
// beyond the captain's limit are skipped individually; the rest proceed. The
// engine is fire-and-forget: it publishes wave packets and never awaits
// execution.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertPublisher};
use crate::app_state::AppState;
use crate::bus::{publish_json, Bus, FLEET_COMMAND_CHANNEL, SMART_ENTRY_CHANNEL};
use crate::market_data::{Liquidity, OrderBookFetcher, OrderBookSnapshot};
use crate::registry::ClientRegistry;
use crate::types::{now_ms, DemandPacket, Exchange, Packet, WavePacket};

// ---------------------------------------------------------------------------
// Wave math
// ---------------------------------------------------------------------------

/// Number of waves for a given wave-cost factor (total demand / liq1).
pub fn wave_count(wcf: f64) -> u32 {
    if wcf <= 0.6 {
        1
    } else if wcf <= 1.1 {
        2
    } else if wcf <= 1.6 {
        3
    } else {
        4
    }
}

/// Weight vector for a wave count. Each vector sums to 1.
pub fn wave_weights(waves: u32) -> &'static [f64] {
    match waves {
        1 => &[1.0],
        2 => &[0.6, 0.4],
        3 => &[0.4, 0.35, 0.25],
        _ => &[0.35, 0.30, 0.20, 0.15],
    }
}

/// Planned waves for one exchange.
#[derive(Debug)]
pub struct WavePlan {
    pub wcf: f64,
    pub waves: u32,
    pub reduction: f64,
    pub packets: Vec<WavePacket>,
}

/// Size one exchange's demand against its ask-side liquidity and split it
/// into weighted wave packets. Zero liquidity yields an empty plan.
pub fn plan_exchange(
    parent: &DemandPacket,
    exchange: &str,
    demands: &HashMap<String, f64>,
    liquidity: &Liquidity,
) -> WavePlan {
    let total_demand: f64 = demands.values().sum();

    if liquidity.liq1 <= 0.0 || total_demand <= 0.0 {
        return WavePlan {
            wcf: f64::INFINITY,
            waves: 0,
            reduction: 0.0,
            packets: Vec::new(),
        };
    }

    let wcf = total_demand / liquidity.liq1;
    let waves = wave_count(wcf);
    let weights = wave_weights(waves);
    let reduction = (liquidity.liq1 / total_demand).min(1.0);

    let mut packets = Vec::with_capacity(waves as usize);
    for (index, weight) in weights.iter().enumerate() {
        let wave_index = index as u32;
        let mut per_client = HashMap::new();
        for (client_id, demand) in demands {
            let amount = demand * reduction * weight;
            if amount > 0.0 {
                per_client.insert(client_id.clone(), amount);
            }
        }
        if per_client.is_empty() {
            continue;
        }
        packets.push(WavePacket {
            signal_id: WavePacket::wave_id(&parent.signal_id, wave_index, exchange),
            parent: parent.signal_id.clone(),
            symbol: parent.symbol.clone(),
            action: parent.action,
            exchange: exchange.to_string(),
            wave_index,
            per_client_amount_usd: per_client,
            timestamp: now_ms(),
        });
    }

    WavePlan {
        wcf,
        waves,
        reduction,
        packets,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Consumes RISKY demand and emits wave packets toward the fleet.
pub struct SmartEntryEngine {
    bus: Arc<dyn Bus>,
    registry: Arc<dyn ClientRegistry>,
    state: Arc<AppState>,
    alerts: Arc<AlertPublisher>,
    fetcher: OrderBookFetcher,
}

impl SmartEntryEngine {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<dyn ClientRegistry>,
        state: Arc<AppState>,
        alerts: Arc<AlertPublisher>,
    ) -> Self {
        Self {
            bus,
            registry,
            state,
            alerts,
            fetcher: OrderBookFetcher::new(),
        }
    }

    /// Consume risky demand packets until the bus ends.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self.bus.subscribe(SMART_ENTRY_CHANNEL).await?;
        info!("smart entry engine listening");

        while let Some(payload) = rx.recv().await {
            self.handle_raw(&payload).await;
        }
        warn!("smart entry channel closed — engine stopping");
        Ok(())
    }

    pub async fn handle_raw(&self, payload: &str) {
        match serde_json::from_str::<Packet>(payload) {
            Ok(Packet::Risky(packet)) => {
                if let Err(e) = self.handle_demand(packet).await {
                    warn!(error = %e, "risky demand handling failed");
                }
            }
            Ok(other) => {
                warn!(packet = ?other, "non-risky packet on smart entry channel — ignored");
            }
            Err(e) => {
                warn!(error = %e, "malformed packet on smart entry channel");
            }
        }
    }

    async fn handle_demand(&self, packet: DemandPacket) -> Result<()> {
        let books = self.fetch_books(&packet).await;
        self.dispatch_with_books(&packet, books).await
    }

    /// Fetch order books concurrently for every known exchange in the packet.
    /// Unknown exchange names are skipped here with a warning.
    async fn fetch_books(
        &self,
        packet: &DemandPacket,
    ) -> Vec<(Exchange, Result<OrderBookSnapshot>)> {
        let mut known = Vec::new();
        for name in packet.per_exchange.keys() {
            match Exchange::parse(name) {
                Some(exchange) => known.push(exchange),
                None => {
                    warn!(exchange = %name, signal_id = %packet.signal_id, "unknown exchange in demand — skipping");
                }
            }
        }
        known.sort_by_key(|e| e.as_str());

        let fetches = known
            .iter()
            .map(|&exchange| self.fetcher.fetch(exchange, &packet.symbol));
        let books = join_all(fetches).await;
        known.into_iter().zip(books).collect()
    }

    /// Plan and publish the waves for each fetched book, in
    /// (exchange, wave_index) order.
    pub(crate) async fn dispatch_with_books(
        &self,
        packet: &DemandPacket,
        books: Vec<(Exchange, Result<OrderBookSnapshot>)>,
    ) -> Result<()> {
        let settings = self
            .registry
            .captain_settings()
            .await
            .context("failed to read captain settings")?;

        for (exchange, book) in books {
            let name = exchange.as_str();
            let Some(demands) = packet.per_exchange.get(name) else {
                continue;
            };

            let book = match book {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        exchange = %name,
                        signal_id = %packet.signal_id,
                        error = %e,
                        "order book unavailable — skipping exchange"
                    );
                    continue;
                }
            };

            if let Some(spread) = book.spread_pct() {
                if spread > settings.spread_limit {
                    warn!(
                        exchange = %name,
                        spread,
                        limit = settings.spread_limit,
                        "spread beyond captain limit — skipping exchange"
                    );
                    self.alerts
                        .emit(Alert::spread(&packet.symbol, name, spread))
                        .await?;
                    continue;
                }
            }

            let liquidity = book.liquidity();
            let plan = plan_exchange(packet, name, demands, &liquidity);
            if plan.packets.is_empty() {
                warn!(
                    exchange = %name,
                    signal_id = %packet.signal_id,
                    liq1 = liquidity.liq1,
                    "no usable ask liquidity — no waves emitted"
                );
                continue;
            }

            info!(
                exchange = %name,
                signal_id = %packet.signal_id,
                wcf = plan.wcf,
                waves = plan.waves,
                reduction = plan.reduction,
                "wave plan ready"
            );
            self.alerts
                .emit(Alert::smart(&packet.symbol, name, plan.wcf, plan.waves))
                .await?;

            for wave in plan.packets {
                let wave_total: f64 = wave.per_client_amount_usd.values().sum();
                let wave_index = wave.wave_index;
                publish_json(
                    self.bus.as_ref(),
                    FLEET_COMMAND_CHANNEL,
                    &Packet::SmartWave(wave),
                )
                .await?;
                self.state.waves_emitted.fetch_add(1, Ordering::Relaxed);
                self.alerts
                    .emit(Alert::wave(&packet.symbol, name, wave_index, wave_total))
                    .await?;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for SmartEntryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartEntryEngine").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::registry::FileRegistry;
    use crate::symbol::Symbol;
    use crate::types::Action;

    fn demand(signal_id: &str, exchange: &str, clients: &[(&str, f64)]) -> DemandPacket {
        let mut per_exchange = HashMap::new();
        per_exchange.insert(
            exchange.to_string(),
            clients
                .iter()
                .map(|(id, usd)| (id.to_string(), *usd))
                .collect(),
        );
        DemandPacket {
            signal_id: signal_id.to_string(),
            symbol: Symbol::parse("BTC/USDT").unwrap(),
            action: Action::Buy,
            per_exchange,
            timestamp: now_ms(),
        }
    }

    fn liq(liq1: f64, liq3: f64) -> Liquidity {
        Liquidity {
            price: Some(100.0),
            liq1,
            liq3,
        }
    }

    fn engine() -> (SmartEntryEngine, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(FileRegistry::empty());
        let state = Arc::new(AppState::new());
        let alerts = Arc::new(AlertPublisher::new(
            bus.clone(),
            registry.clone(),
            state.clone(),
        ));
        (
            SmartEntryEngine::new(bus.clone(), registry, state, alerts),
            bus,
        )
    }

    #[test]
    fn wave_count_boundaries() {
        assert_eq!(wave_count(0.6), 1);
        assert_eq!(wave_count(0.601), 2);
        assert_eq!(wave_count(1.1), 2);
        assert_eq!(wave_count(1.101), 3);
        assert_eq!(wave_count(1.6), 3);
        assert_eq!(wave_count(1.61), 4);
        assert_eq!(wave_count(100.0), 4);
    }

    #[test]
    fn wave_weights_sum_to_one() {
        for waves in 1..=4 {
            let sum: f64 = wave_weights(waves).iter().sum();
            assert!(
                (sum - 1.0).abs() < 1e-12,
                "weights for {waves} waves sum to {sum}"
            );
        }
    }

    #[test]
    fn reduction_scales_every_client_equally() {
        let packet = demand("s1", "okx", &[("u1", 600.0), ("u2", 400.0)]);
        let plan = plan_exchange(
            &packet,
            "okx",
            &packet.per_exchange["okx"],
            &liq(400.0, 1000.0),
        );

        assert!((plan.reduction - 0.4).abs() < 1e-12);
        let u1_total: f64 = plan
            .packets
            .iter()
            .filter_map(|w| w.per_client_amount_usd.get("u1"))
            .sum();
        let u2_total: f64 = plan
            .packets
            .iter()
            .filter_map(|w| w.per_client_amount_usd.get("u2"))
            .sum();
        assert!((u1_total - 240.0).abs() < 1e-9);
        assert!((u2_total - 160.0).abs() < 1e-9);
    }

    #[test]
    fn zero_liquidity_emits_no_waves() {
        let packet = demand("s1", "okx", &[("u1", 1000.0)]);
        let plan = plan_exchange(&packet, "okx", &packet.per_exchange["okx"], &liq(0.0, 0.0));
        assert!(plan.packets.is_empty());
        assert_eq!(plan.reduction, 0.0);
        assert!(plan.wcf.is_infinite());
    }

    #[test]
    fn capped_liquidity_splits_into_four_weighted_waves() {
        // demand 1000 against liq1 500: WCF 2.0, reduction 0.5,
        // final total 500 split [175, 150, 100, 75].
        let packet = demand("s2", "okx", &[("u1", 1000.0)]);
        let plan = plan_exchange(
            &packet,
            "okx",
            &packet.per_exchange["okx"],
            &liq(500.0, 2000.0),
        );

        assert!((plan.wcf - 2.0).abs() < 1e-12);
        assert_eq!(plan.waves, 4);
        assert_eq!(plan.packets.len(), 4);

        let amounts: Vec<f64> = plan
            .packets
            .iter()
            .map(|w| w.per_client_amount_usd["u1"])
            .collect();
        let expected = [175.0, 150.0, 100.0, 75.0];
        for (got, want) in amounts.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }

        assert_eq!(plan.packets[0].signal_id, "s2_w0_okx");
        assert_eq!(plan.packets[3].signal_id, "s2_w3_okx");
        assert_eq!(plan.packets[1].parent, "s2");
    }

    #[tokio::test]
    async fn unknown_exchange_is_skipped_entirely() {
        let (engine, bus) = engine();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        let packet = demand("s3", "kraken", &[("u1", 1000.0)]);
        let books = engine.fetch_books(&packet).await;
        assert!(books.is_empty());

        engine.dispatch_with_books(&packet, books).await.unwrap();
        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn unavailable_book_skips_only_that_exchange() {
        let (engine, bus) = engine();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();

        let mut packet = demand("s4", "okx", &[("u1", 100.0)]);
        packet
            .per_exchange
            .insert("binance".to_string(), HashMap::from([("u2".to_string(), 100.0)]));

        let books = vec![
            (Exchange::Okx, Err(anyhow::anyhow!("timeout"))),
            (
                Exchange::Binance,
                Ok(OrderBookSnapshot {
                    best_bid: Some(99.9),
                    asks: vec![(100.0, 10.0)],
                }),
            ),
        ];
        engine.dispatch_with_books(&packet, books).await.unwrap();

        // Only Binance waves (WCF 0.1 -> a single wave) made it out.
        let payload = fleet.recv().await.unwrap();
        match serde_json::from_str::<Packet>(&payload).unwrap() {
            Packet::SmartWave(w) => {
                assert_eq!(w.exchange, "binance");
                assert_eq!(w.wave_index, 0);
                assert!((w.per_client_amount_usd["u2"] - 100.0).abs() < 1e-9);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert!(fleet.try_recv().is_err());
    }

    #[tokio::test]
    async fn wide_spread_trips_the_gate() {
        let (engine, bus) = engine();
        let mut fleet = bus.subscribe(FLEET_COMMAND_CHANNEL).await.unwrap();
        let mut feed = bus
            .subscribe(crate::bus::ALERT_FEED_CHANNEL)
            .await
            .unwrap();

        let packet = demand("s5", "okx", &[("u1", 100.0)]);
        // Best bid 90 vs ask 100: ~10.5 % spread against a 1 % default limit.
        let books = vec![(
            Exchange::Okx,
            Ok(OrderBookSnapshot {
                best_bid: Some(90.0),
                asks: vec![(100.0, 10.0)],
            }),
        )];
        engine.dispatch_with_books(&packet, books).await.unwrap();

        assert!(fleet.try_recv().is_err());
        let alert: crate::alerts::Alert =
            serde_json::from_str(&feed.recv().await.unwrap()).unwrap();
        assert_eq!(alert.kind, crate::alerts::AlertKind::Spread);
    }
}
