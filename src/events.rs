// =============================================================================
// Event Bus — per-topic ordered fan-out
// =============================================================================
//
// One bounded tokio broadcast channel per topic. Publishing stamps a
// per-topic sequence number and never blocks; a subscriber that falls more
// than the buffer behind observes `Lagged` and is disconnected by its
// serving task with a `subscriber_lagged` diagnostic.
//
// Topics: quotes/<symbol>, orders/<account>, fills/<account>,
// strategies/<id>, accounts/<id>, alerts.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock;

/// Envelope type tag, mirrored on the streaming wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Quote,
    Order,
    Fill,
    Account,
    Position,
    Alert,
    StrategyModeChange,
    Violation,
    SubscriptionAck,
    Error,
}

/// A single event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event id; streaming clients dedupe on this.
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub topic: String,
    /// Per-topic sequence number, strictly increasing from 1.
    pub seq: u64,
    pub data: serde_json::Value,
    /// Publish time, UNIX milliseconds.
    pub ts: i64,
}

struct Topic {
    tx: broadcast::Sender<Envelope>,
    /// Guards sequencing AND sending, so the delivery order every subscriber
    /// observes equals sequence-number order even with concurrent publishers.
    seq: Mutex<u64>,
}

/// Per-topic fan-out hub shared by all publishers and the streaming API.
pub struct EventBus {
    buffer: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(16),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(t) = self.topics.read().get(name) {
            return t.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.buffer);
                Arc::new(Topic {
                    tx,
                    seq: Mutex::new(0),
                })
            })
            .clone()
    }

    /// Publish an event. Never blocks; events on topics with no subscribers
    /// are dropped after sequencing so that seq numbers stay continuous.
    pub fn publish(&self, event_type: EventType, topic: &str, data: serde_json::Value) -> u64 {
        let t = self.topic(topic);

        let mut seq_guard = t.seq.lock();
        *seq_guard += 1;
        let seq = *seq_guard;

        let envelope = Envelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            topic: topic.to_string(),
            seq,
            data,
            ts: clock::now_ms(),
        };

        // A send error only means there are currently no receivers. The seq
        // guard stays held through the send.
        let receivers = t.tx.send(envelope).unwrap_or(0);
        drop(seq_guard);

        debug!(topic, seq, receivers, "event published");
        seq
    }

    /// Subscribe to one topic. The receiver observes per-topic FIFO order.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.topic(topic).tx.subscribe()
    }

    /// Last sequence number published on a topic (0 if never published).
    pub fn last_seq(&self, topic: &str) -> u64 {
        self.topics
            .read()
            .get(topic)
            .map(|t| *t.seq.lock())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer", &self.buffer)
            .field("topics", &self.topics.read().len())
            .finish()
    }
}

// =============================================================================
// Topic name helpers
// =============================================================================

pub fn quotes_topic(symbol: &str) -> String {
    format!("quotes/{symbol}")
}

pub fn orders_topic(account_id: &str) -> String {
    format!("orders/{account_id}")
}

pub fn fills_topic(account_id: &str) -> String {
    format!("fills/{account_id}")
}

pub fn strategies_topic(strategy_id: &str) -> String {
    format!("strategies/{strategy_id}")
}

pub fn accounts_topic(account_id: &str) -> String {
    format!("accounts/{account_id}")
}

pub const ALERTS_TOPIC: &str = "alerts";
