// =============================================================================
// Central Pipeline State — Horus Nexus core
// =============================================================================
//
// Shared operational state for the dispatcher: lock-free counters for every
// pipeline stage, capped ring buffers of recent execution records and alerts,
// and the Eye's connection state. The REST API serves a snapshot of all of
// it.
//
// Thread safety:
//   - Atomic counters for lock-free stage accounting.
//   - parking_lot::RwLock for the ring buffers; never held across await.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::alerts::Alert;
use crate::eye::EyeConnectionState;
use crate::types::ExecutionRecord;

/// Maximum number of recent execution records to retain.
const MAX_RECENT_EXECUTIONS: usize = 100;
/// Maximum number of recent alerts to retain.
const MAX_RECENT_ALERTS: usize = 100;

/// Central state shared across all pipeline tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation so API consumers can detect fresh data.
    pub state_version: AtomicU64,

    // ── Stage counters ──────────────────────────────────────────────────
    pub signals_received: AtomicU64,
    pub signals_dropped: AtomicU64,
    pub packets_normal: AtomicU64,
    pub packets_risky: AtomicU64,
    pub waves_emitted: AtomicU64,
    pub orders_executed: AtomicU64,
    pub orders_failed: AtomicU64,

    // ── Recent activity ─────────────────────────────────────────────────
    pub recent_executions: RwLock<Vec<ExecutionRecord>>,
    pub recent_alerts: RwLock<Vec<Alert>>,

    // ── Eye ─────────────────────────────────────────────────────────────
    pub eye_state: RwLock<EyeConnectionState>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            state_version: AtomicU64::new(1),
            signals_received: AtomicU64::new(0),
            signals_dropped: AtomicU64::new(0),
            packets_normal: AtomicU64::new(0),
            packets_risky: AtomicU64::new(0),
            waves_emitted: AtomicU64::new(0),
            orders_executed: AtomicU64::new(0),
            orders_failed: AtomicU64::new(0),
            recent_executions: RwLock::new(Vec::new()),
            recent_alerts: RwLock::new(Vec::new()),
            eye_state: RwLock::new(EyeConnectionState::Disconnected),
            start_time: std::time::Instant::now(),
        }
    }

    /// Atomically increment the state version.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an execution outcome; the ring buffer is capped at
    /// [`MAX_RECENT_EXECUTIONS`].
    pub fn push_execution(&self, record: ExecutionRecord) {
        {
            let mut executions = self.recent_executions.write();
            executions.push(record);
            while executions.len() > MAX_RECENT_EXECUTIONS {
                executions.remove(0);
            }
        }
        self.increment_version();
    }

    /// Record an emitted alert; the ring buffer is capped at
    /// [`MAX_RECENT_ALERTS`].
    pub fn push_alert(&self, alert: Alert) {
        {
            let mut alerts = self.recent_alerts.write();
            alerts.push(alert);
            while alerts.len() > MAX_RECENT_ALERTS {
                alerts.remove(0);
            }
        }
        self.increment_version();
    }

    pub fn set_eye_state(&self, state: EyeConnectionState) {
        *self.eye_state.write() = state;
        self.increment_version();
    }

    /// Build the serialisable snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            eye_state: *self.eye_state.read(),
            counters: PipelineCounters {
                signals_received: self.signals_received.load(Ordering::Relaxed),
                signals_dropped: self.signals_dropped.load(Ordering::Relaxed),
                packets_normal: self.packets_normal.load(Ordering::Relaxed),
                packets_risky: self.packets_risky.load(Ordering::Relaxed),
                waves_emitted: self.waves_emitted.load(Ordering::Relaxed),
                orders_executed: self.orders_executed.load(Ordering::Relaxed),
                orders_failed: self.orders_failed.load(Ordering::Relaxed),
            },
            recent_executions: self.recent_executions.read().clone(),
            recent_alerts: self.recent_alerts.read().clone(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PipelineCounters {
    pub signals_received: u64,
    pub signals_dropped: u64,
    pub packets_normal: u64,
    pub packets_risky: u64,
    pub waves_emitted: u64,
    pub orders_executed: u64,
    pub orders_failed: u64,
}

/// Full pipeline snapshot served to the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub eye_state: EyeConnectionState,
    pub counters: PipelineCounters,
    pub recent_executions: Vec<ExecutionRecord>,
    pub recent_alerts: Vec<Alert>,
}
