// =============================================================================
// Alert Feed — structured records for the operator console
// =============================================================================
//
// Alerts are advisory: they ride their own bus channel toward the operator
// console and are suppressed per kind by the captain's settings. Suppression
// only silences the feed — execution records are always written regardless.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::bus::{publish_json, Bus, ALERT_FEED_CHANNEL};
use crate::registry::{CaptainSettings, ClientRegistry};
use crate::symbol::Symbol;

/// Every alert kind the operator console understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Entry,
    Fail,
    Spread,
    Smart,
    Wave,
    NewClient,
    ClientStop,
}

/// One structured alert record. Only the fields relevant to the kind are
/// populated; the rest serialise away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symbol: Option<Symbol>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spread: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub waves: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wcf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wave_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exchange: Option<String>,
    pub at: String,
}

impl Alert {
    fn base(kind: AlertKind) -> Self {
        Self {
            kind,
            client_id: None,
            symbol: None,
            amount: None,
            price: None,
            reason: None,
            spread: None,
            waves: None,
            wcf: None,
            wave_index: None,
            exchange: None,
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Successful per-client entry.
    pub fn entry(client_id: &str, symbol: &Symbol, amount: f64, exchange: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            symbol: Some(symbol.clone()),
            amount: Some(amount),
            exchange: Some(exchange.to_string()),
            ..Self::base(AlertKind::Entry)
        }
    }

    /// Failed per-client order.
    pub fn fail(
        client_id: &str,
        symbol: &Symbol,
        amount: f64,
        exchange: &str,
        reason: &str,
    ) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            symbol: Some(symbol.clone()),
            amount: Some(amount),
            exchange: Some(exchange.to_string()),
            reason: Some(reason.to_string()),
            ..Self::base(AlertKind::Fail)
        }
    }

    /// Spread gate tripped on an exchange.
    pub fn spread(symbol: &Symbol, exchange: &str, spread: f64) -> Self {
        Self {
            symbol: Some(symbol.clone()),
            exchange: Some(exchange.to_string()),
            spread: Some(spread),
            ..Self::base(AlertKind::Spread)
        }
    }

    /// Smart entry plan summary for one exchange.
    pub fn smart(symbol: &Symbol, exchange: &str, wcf: f64, waves: u32) -> Self {
        Self {
            symbol: Some(symbol.clone()),
            exchange: Some(exchange.to_string()),
            wcf: Some(wcf),
            waves: Some(waves),
            ..Self::base(AlertKind::Smart)
        }
    }

    /// One emitted wave.
    pub fn wave(symbol: &Symbol, exchange: &str, wave_index: u32, amount: f64) -> Self {
        Self {
            symbol: Some(symbol.clone()),
            exchange: Some(exchange.to_string()),
            wave_index: Some(wave_index),
            amount: Some(amount),
            ..Self::base(AlertKind::Wave)
        }
    }
}

/// Per-kind toggle from the captain's settings.
fn kind_enabled(settings: &CaptainSettings, kind: AlertKind) -> bool {
    match kind {
        AlertKind::Entry => settings.alert_entry,
        AlertKind::Fail => settings.alert_fail,
        AlertKind::Spread => settings.alert_spread,
        AlertKind::Smart => settings.alert_smart,
        AlertKind::Wave => settings.alert_wave,
        AlertKind::NewClient => settings.alert_new_client,
        AlertKind::ClientStop => settings.alert_client_stop,
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Publishes alerts onto the feed channel, honouring the captain's toggles.
pub struct AlertPublisher {
    bus: Arc<dyn Bus>,
    registry: Arc<dyn ClientRegistry>,
    state: Arc<AppState>,
}

impl AlertPublisher {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<dyn ClientRegistry>, state: Arc<AppState>) -> Self {
        Self {
            bus,
            registry,
            state,
        }
    }

    /// Emit `alert` unless the captain has suppressed its kind. Settings are
    /// read on demand so toggles apply without a restart.
    pub async fn emit(&self, alert: Alert) -> Result<()> {
        let settings = match self.registry.captain_settings().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "captain settings unavailable — using defaults");
                CaptainSettings::default()
            }
        };

        if !settings.notifications_enabled || !kind_enabled(&settings, alert.kind) {
            debug!(kind = ?alert.kind, "alert suppressed by captain settings");
            return Ok(());
        }

        publish_json(self.bus.as_ref(), ALERT_FEED_CHANNEL, &alert).await?;
        self.state.push_alert(alert);
        Ok(())
    }
}

impl std::fmt::Debug for AlertPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertPublisher").finish_non_exhaustive()
    }
}
