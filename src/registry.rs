// =============================================================================
// Client Registry — roster and captain settings, read-only to the core
// =============================================================================
//
// The roster and captain settings are owned by the operator tools; the core
// only ever reads them. The `ClientRegistry` trait is that read interface.
// `FileRegistry` serves a JSON roster from memory, loaded once at startup with
// the same defaulting discipline as the rest of the configuration: every field
// carries a serde default so an older roster file keeps deserialising.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway::Credentials;
use crate::types::Exchange;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_allocation() -> f64 {
    10.0
}

fn default_spread_limit() -> f64 {
    1.0
}

// =============================================================================
// ClientRecord
// =============================================================================

/// One follower account as stored by the operator tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub exchange: Exchange,
    pub api_key: String,
    pub api_secret: String,
    /// OKX passphrase; unused by the other exchanges.
    #[serde(default)]
    pub extra_password: Option<String>,
    /// Declared figure, not a live balance.
    #[serde(default)]
    pub balance_usdt: f64,
    /// Fraction of the balance committed per signal, in percent (0..=100).
    #[serde(default = "default_allocation")]
    pub allocation: f64,
    /// Per-client maximum tolerable spread, in percent.
    #[serde(default = "default_spread_limit")]
    pub spread_limit: f64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ClientRecord {
    /// A client receives signals iff it is active, approved, and funded.
    pub fn is_eligible(&self) -> bool {
        self.active && self.approved && self.balance_usdt > 0.0
    }

    /// USD the client commits to one signal: `balance × allocation / 100`.
    pub fn usd_to_commit(&self) -> f64 {
        self.balance_usdt * self.allocation / 100.0
    }

    /// Exchange credentials, read on demand at dispatch time.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            passphrase: self.extra_password.clone(),
        }
    }
}

// =============================================================================
// CaptainSettings
// =============================================================================

/// Singleton settings keyed by the captain. Missing fields default as
/// documented: toggles on, commission zero, spread limit 1 %.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptainSettings {
    #[serde(default)]
    pub commission_pct: f64,
    /// Global spread limit in percent, checked before risky entries.
    #[serde(default = "default_spread_limit")]
    pub spread_limit: f64,
    #[serde(default = "default_true")]
    pub smart_entry_enabled: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub risky_mode_enabled: bool,

    // Per-alert-kind toggles.
    #[serde(default = "default_true")]
    pub alert_entry: bool,
    #[serde(default = "default_true")]
    pub alert_fail: bool,
    #[serde(default = "default_true")]
    pub alert_spread: bool,
    #[serde(default = "default_true")]
    pub alert_smart: bool,
    #[serde(default = "default_true")]
    pub alert_wave: bool,
    #[serde(default = "default_true")]
    pub alert_new_client: bool,
    #[serde(default = "default_true")]
    pub alert_client_stop: bool,
}

impl Default for CaptainSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings object deserialises")
    }
}

// =============================================================================
// ClientRegistry trait
// =============================================================================

/// Read interface to the client/settings store.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// All clients currently eligible for signal dispatch.
    async fn eligible_clients(&self) -> Result<Vec<ClientRecord>>;

    /// Look up one client by id.
    async fn client(&self, client_id: &str) -> Result<Option<ClientRecord>>;

    /// The captain's current settings.
    async fn captain_settings(&self) -> Result<CaptainSettings>;
}

// =============================================================================
// FileRegistry
// =============================================================================

/// On-disk roster shape: clients plus the captain settings document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RosterFile {
    #[serde(default)]
    clients: Vec<ClientRecord>,
    #[serde(default)]
    captain_settings: Option<CaptainSettings>,
}

/// Registry backed by a JSON roster file, served entirely from memory.
pub struct FileRegistry {
    clients: RwLock<HashMap<String, ClientRecord>>,
    settings: RwLock<CaptainSettings>,
}

impl FileRegistry {
    pub fn empty() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            settings: RwLock::new(CaptainSettings::default()),
        }
    }

    /// Load the roster from `path`. Allocation values outside 0..=100 are
    /// clamped with a warning rather than rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read roster from {}", path.display()))?;
        let roster: RosterFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse roster from {}", path.display()))?;

        let registry = Self::empty();
        for client in roster.clients {
            registry.upsert(client);
        }
        if let Some(settings) = roster.captain_settings {
            *registry.settings.write() = settings;
        }

        info!(
            path = %path.display(),
            clients = registry.clients.read().len(),
            "client roster loaded"
        );
        Ok(registry)
    }

    /// Insert or replace a client record, clamping allocation to 0..=100.
    pub fn upsert(&self, mut client: ClientRecord) {
        if !(0.0..=100.0).contains(&client.allocation) {
            warn!(
                client_id = %client.client_id,
                allocation = client.allocation,
                "allocation outside 0..=100 — clamping"
            );
            client.allocation = client.allocation.clamp(0.0, 100.0);
        }
        self.clients
            .write()
            .insert(client.client_id.clone(), client);
    }

    pub fn set_settings(&self, settings: CaptainSettings) {
        *self.settings.write() = settings;
    }
}

#[async_trait]
impl ClientRegistry for FileRegistry {
    async fn eligible_clients(&self) -> Result<Vec<ClientRecord>> {
        Ok(self
            .clients
            .read()
            .values()
            .filter(|c| c.is_eligible())
            .cloned()
            .collect())
    }

    async fn client(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        Ok(self.clients.read().get(client_id).cloned())
    }

    async fn captain_settings(&self) -> Result<CaptainSettings> {
        Ok(self.settings.read().clone())
    }
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("clients", &self.clients.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str, balance: f64, active: bool, approved: bool) -> ClientRecord {
        ClientRecord {
            client_id: id.to_string(),
            exchange: Exchange::Okx,
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            extra_password: None,
            balance_usdt: balance,
            allocation: 10.0,
            spread_limit: 1.0,
            active,
            approved,
            created_at: None,
        }
    }

    #[test]
    fn eligibility_requires_active_approved_and_funded() {
        assert!(client("a", 1000.0, true, true).is_eligible());
        assert!(!client("b", 0.0, true, true).is_eligible());
        assert!(!client("c", 1000.0, false, true).is_eligible());
        assert!(!client("d", 1000.0, true, false).is_eligible());
    }

    #[test]
    fn usd_to_commit_is_allocation_fraction_of_balance() {
        let mut c = client("a", 1000.0, true, true);
        assert!((c.usd_to_commit() - 100.0).abs() < f64::EPSILON);
        c.allocation = 20.0;
        c.balance_usdt = 500.0;
        assert!((c.usd_to_commit() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn upsert_clamps_out_of_range_allocation() {
        let registry = FileRegistry::empty();
        let mut c = client("a", 1000.0, true, true);
        c.allocation = 150.0;
        registry.upsert(c);
        let stored = registry.clients.read().get("a").cloned().unwrap();
        assert!((stored.allocation - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn client_record_defaults_fill_missing_fields() {
        let c: ClientRecord = serde_json::from_str(
            r#"{"client_id":"u1","exchange":"okx","api_key":"k","api_secret":"s"}"#,
        )
        .unwrap();
        assert!((c.allocation - 10.0).abs() < f64::EPSILON);
        assert!((c.spread_limit - 1.0).abs() < f64::EPSILON);
        assert!(c.active);
        assert!(!c.approved);
        assert_eq!(c.balance_usdt, 0.0);
    }

    #[test]
    fn captain_settings_default_to_everything_enabled() {
        let s = CaptainSettings::default();
        assert!(s.smart_entry_enabled);
        assert!(s.risky_mode_enabled);
        assert!(s.notifications_enabled);
        assert!(s.alert_entry && s.alert_fail && s.alert_wave);
        assert_eq!(s.commission_pct, 0.0);
        assert!((s.spread_limit - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn eligible_clients_filters_the_roster() {
        let registry = FileRegistry::empty();
        registry.upsert(client("a", 1000.0, true, true));
        registry.upsert(client("b", 0.0, true, true));
        registry.upsert(client("c", 500.0, true, false));

        let eligible = registry.eligible_clients().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].client_id, "a");
    }
}
