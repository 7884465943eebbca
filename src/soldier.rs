// =============================================================================
// Soldiers — per-exchange execution adapters with a uniform result envelope
// =============================================================================
//
// A Soldier normalizes the canonical symbol to its exchange-native form,
// invokes the matching Gateway operation, and wraps whatever happened into a
// SoldierReport. Soldiers are stateless and never retry. The dispatch
// registry maps exchange -> soldier; supporting a new exchange means
// implementing the trait and registering the instance.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::gateway::binance::BinanceGateway;
use crate::gateway::bybit::BybitGateway;
use crate::gateway::okx::OkxGateway;
use crate::gateway::{CloseOutcome, Credentials};
use crate::symbol::Symbol;
use crate::types::{Exchange, ExecutionStatus};

/// Reason attached to a close that found no base balance to sell.
pub const NOTHING_TO_CLOSE: &str = "nothing_to_close";

// ---------------------------------------------------------------------------
// Result envelope
// ---------------------------------------------------------------------------

/// Uniform outcome wrapper returned by every Soldier operation.
#[derive(Debug, Clone, Serialize)]
pub struct SoldierReport {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SoldierReport {
    pub fn executed(data: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Executed,
            data: Some(data),
            reason: None,
        }
    }

    /// Success that carried no order (e.g. nothing to close).
    pub fn executed_with_reason(reason: &str) -> Self {
        Self {
            status: ExecutionStatus::Executed,
            data: None,
            reason: Some(reason.to_string()),
        }
    }

    pub fn failed(reason: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            data: None,
            reason: Some(reason),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == ExecutionStatus::Executed
    }
}

fn order_report(result: Result<serde_json::Value>) -> SoldierReport {
    match result {
        Ok(data) => SoldierReport::executed(data),
        Err(e) => SoldierReport::failed(format!("{e:#}")),
    }
}

fn close_report(result: Result<CloseOutcome>) -> SoldierReport {
    match result {
        Ok(CloseOutcome::Closed(data)) => SoldierReport::executed(data),
        Ok(CloseOutcome::NothingToClose) => SoldierReport::executed_with_reason(NOTHING_TO_CLOSE),
        Err(e) => SoldierReport::failed(format!("{e:#}")),
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One execution adapter per supported exchange.
#[async_trait]
pub trait Soldier: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn market_buy(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport;

    async fn market_sell(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport;

    async fn close_position(&self, creds: &Credentials, symbol: &Symbol) -> SoldierReport;
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

pub struct OkxSoldier {
    gateway: OkxGateway,
}

impl OkxSoldier {
    pub fn new() -> Self {
        Self {
            gateway: OkxGateway::new(),
        }
    }
}

#[async_trait]
impl Soldier for OkxSoldier {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn market_buy(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_buy(creds, symbol, usd).await)
    }

    async fn market_sell(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_sell(creds, symbol, usd).await)
    }

    async fn close_position(&self, creds: &Credentials, symbol: &Symbol) -> SoldierReport {
        close_report(self.gateway.close_position(creds, symbol).await)
    }
}

pub struct BinanceSoldier {
    gateway: BinanceGateway,
}

impl BinanceSoldier {
    pub fn new() -> Self {
        Self {
            gateway: BinanceGateway::new(),
        }
    }
}

#[async_trait]
impl Soldier for BinanceSoldier {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn market_buy(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_buy(creds, symbol, usd).await)
    }

    async fn market_sell(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_sell(creds, symbol, usd).await)
    }

    async fn close_position(&self, creds: &Credentials, symbol: &Symbol) -> SoldierReport {
        close_report(self.gateway.close_position(creds, symbol).await)
    }
}

pub struct BybitSoldier {
    gateway: BybitGateway,
}

impl BybitSoldier {
    pub fn new() -> Self {
        Self {
            gateway: BybitGateway::new(),
        }
    }
}

#[async_trait]
impl Soldier for BybitSoldier {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn market_buy(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_buy(creds, symbol, usd).await)
    }

    async fn market_sell(&self, creds: &Credentials, symbol: &Symbol, usd: f64) -> SoldierReport {
        order_report(self.gateway.market_sell(creds, symbol, usd).await)
    }

    async fn close_position(&self, creds: &Credentials, symbol: &Symbol) -> SoldierReport {
        close_report(self.gateway.close_position(creds, symbol).await)
    }
}

// ---------------------------------------------------------------------------
// Dispatch registry
// ---------------------------------------------------------------------------

/// Exchange -> Soldier map used by the fleet executor.
pub struct SoldierRegistry {
    soldiers: HashMap<Exchange, Arc<dyn Soldier>>,
}

impl SoldierRegistry {
    pub fn empty() -> Self {
        Self {
            soldiers: HashMap::new(),
        }
    }

    /// Registry with all built-in soldiers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(OkxSoldier::new()));
        registry.register(Arc::new(BinanceSoldier::new()));
        registry.register(Arc::new(BybitSoldier::new()));
        registry
    }

    pub fn register(&mut self, soldier: Arc<dyn Soldier>) {
        self.soldiers.insert(soldier.exchange(), soldier);
    }

    pub fn get(&self, exchange: Exchange) -> Option<Arc<dyn Soldier>> {
        self.soldiers.get(&exchange).cloned()
    }
}

impl std::fmt::Debug for SoldierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoldierRegistry")
            .field("exchanges", &self.soldiers.keys().collect::<Vec<_>>())
            .finish()
    }
}
