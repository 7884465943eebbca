// =============================================================================
// Bus — pub/sub channels connecting the pipeline components
// =============================================================================
//
// The bus is an external collaborator: multi-writer, multi-reader, durable
// enough to bridge brief consumer outages but not persistent. At-least-once
// delivery is NOT assumed; consumers tolerate missed messages. Channel names
// are preserved verbatim for wire compatibility with the operator tools.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Intent signals (console, Eye -> Brain).
pub const CAPTAIN_SIGNALS_CHANNEL: &str = "HORUS_CAPTAIN_SIGNALS";
/// Alternate intent channel from the console.
pub const BRAIN_SIGNALS_CHANNEL: &str = "HORUS_BRAIN_SIGNALS";
/// RISKY demand (Brain -> Engine).
pub const SMART_ENTRY_CHANNEL: &str = "HORUS_SMART_ENTRY";
/// Execution packets (Brain/Engine -> Fleet).
pub const FLEET_COMMAND_CHANNEL: &str = "NEXUS_FLEET_COMMAND";
/// Structured alert feed (Fleet/Engine -> operator console).
pub const ALERT_FEED_CHANNEL: &str = "HORUS_ALERTS";

/// Buffered messages per subscriber before publishes start lagging.
const SUBSCRIBER_BUFFER: usize = 256;

// =============================================================================
// Trait
// =============================================================================

/// Pub/sub interface the core talks to. Implemented over Redis in production
/// and in memory for tests.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to `channel`; messages arrive on the returned receiver for
    /// as long as the subscription task lives.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// Serialize `value` and publish it on `channel`.
pub async fn publish_json<T: Serialize>(bus: &dyn Bus, channel: &str, value: &T) -> Result<()> {
    let payload = serde_json::to_string(value).context("failed to serialise bus payload")?;
    bus.publish(channel, payload).await
}

// =============================================================================
// RedisBus
// =============================================================================

/// Redis-backed bus. Publishes over a shared multiplexed connection; each
/// subscription holds its own pub/sub connection pumped into an mpsc channel.
pub struct RedisBus {
    client: redis::Client,
    publish_conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        info!(url = %url, "bus connected");
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .with_context(|| format!("failed to publish on {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("failed to open redis subscription connection")?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "non-UTF8 bus payload dropped");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!(channel = %channel_name, "subscriber dropped — ending pump");
                    break;
                }
            }
            warn!(channel = %channel_name, "bus subscription stream ended");
        });

        info!(channel = %channel, "subscribed");
        Ok(rx)
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

// =============================================================================
// MemoryBus
// =============================================================================

/// In-process bus used by the test suite: fans every publish out to all
/// live subscribers of the channel.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // Senders are cloned out before awaiting so the lock never spans a
        // suspension point.
        let senders: Vec<mpsc::Sender<String>> = {
            let mut topics = self.topics.lock();
            if let Some(subs) = topics.get_mut(channel) {
                subs.retain(|tx| !tx.is_closed());
                subs.clone()
            } else {
                Vec::new()
            }
        };

        for tx in senders {
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.topics
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("topics", &self.topics.lock().len())
            .finish()
    }
}
