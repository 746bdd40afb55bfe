// =============================================================================
// Broker Capability — the one interface every execution backend wears
// =============================================================================
//
// Live feeds (tradovate, tastytrade, schwab, topstepx) are instances of the
// HTTP adapter; the paper simulator implements the same trait in-process.
// The router only ever sees `Arc<dyn BrokerAdapter>`.
//
// Failure semantics: transient errors (5xx, timeout, disconnect) are retried
// with exponential backoff and jitter, at most MAX_ATTEMPTS times; submit is
// retried only because every submission carries an idempotency key
// (account_id, alert_id) the backend dedupes on. Everything else surfaces as
// a terminal rejection.
// =============================================================================

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::orders::{Fill, Order};
use crate::types::OrderStatus;

/// Retry ceiling for transient failures.
pub const MAX_ATTEMPTS: u32 = 5;
/// Base delay for the exponential backoff schedule.
pub const BACKOFF_BASE_MS: u64 = 200;

// =============================================================================
// Error model
// =============================================================================

/// Adapter-facing error split the retry loop keys on.
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// 5xx, timeout, disconnect: safe to retry under an idempotency key.
    Transient(String),
    /// Anything else: surfaces as a rejected order.
    Permanent(String),
}

impl BrokerError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "transient broker error: {m}"),
            Self::Permanent(m) => write!(f, "permanent broker error: {m}"),
        }
    }
}

impl std::error::Error for BrokerError {}

// =============================================================================
// Capability types
// =============================================================================

/// Acknowledgement returned by `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAck {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Ok,
    NotFound,
    AlreadyTerminal,
}

/// Read-through-cached view of one backend account.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub day_pnl: f64,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub net_qty: f64,
    pub avg_entry: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

/// Connectivity report surfaced on /api/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub connected: bool,
    #[serde(default)]
    pub last_ok: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when an internal invariant failed; the backend refuses traffic.
    #[serde(default)]
    pub degraded: bool,
}

impl Default for AdapterHealth {
    fn default() -> Self {
        Self {
            connected: false,
            last_ok: None,
            last_error: None,
            degraded: false,
        }
    }
}

// =============================================================================
// The capability trait
// =============================================================================

/// One execution backend: live broker, broker sandbox, or paper simulator.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Backend tag ("simulator", "tradovate", ...).
    fn name(&self) -> &str;

    /// Submit an order. Idempotent on retry: the backend dedupes on the
    /// order's `(account_id, alert_id)` pair.
    async fn submit(&self, order: &Order) -> Result<SubmitAck, BrokerError>;

    /// Cancel a working order.
    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError>;

    /// Close all open positions for the account with market orders.
    /// Best-effort atomic; returns the number of positions closed.
    async fn flatten(&self, account_id: &str) -> Result<usize, BrokerError>;

    /// Stream of fills for the account. Finite only on adapter shutdown;
    /// restartable on reconnect, resuming after `last_seen_fill_id`.
    async fn subscribe_fills(
        &self,
        account_id: &str,
        last_seen_fill_id: Option<String>,
    ) -> Result<mpsc::Receiver<Fill>, BrokerError>;

    /// Balances and positions for the account.
    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot, BrokerError>;

    /// Connectivity and degradation report.
    fn health(&self) -> AdapterHealth;
}

// =============================================================================
// Feed endpoint table
// =============================================================================

/// REST + fill-stream endpoints for the known live/sandbox feeds.
#[derive(Debug, Clone, Copy)]
pub struct HttpFeedEndpoints {
    pub base_url: &'static str,
    pub stream_url: &'static str,
}

impl HttpFeedEndpoints {
    pub fn for_feed(feed: &str) -> Option<Self> {
        match feed {
            "tradovate" => Some(Self {
                base_url: "https://live.tradovateapi.com",
                stream_url: "wss://live.tradovateapi.com/v1/websocket",
            }),
            "tastytrade" => Some(Self {
                base_url: "https://api.tastyworks.com",
                stream_url: "wss://streamer.tastyworks.com",
            }),
            "schwab" => Some(Self {
                base_url: "https://api.schwabapi.com/trader",
                stream_url: "wss://stream.schwabapi.com",
            }),
            "topstepx" => Some(Self {
                base_url: "https://api.topstepx.com",
                stream_url: "wss://rtc.topstepx.com",
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Backend name -> adapter, populated from configuration at startup.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BrokerAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn BrokerAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, backend: &str) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.get(backend).cloned()
    }

    /// Health of every registered backend, keyed by name.
    pub fn health_all(&self) -> HashMap<String, AdapterHealth> {
        self.adapters
            .iter()
            .map(|(name, a)| (name.clone(), a.health()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

// =============================================================================
// Retry helper
// =============================================================================

/// Exponential backoff delay with jitter for the given 1-based attempt.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    use rand::Rng;
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(8));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    std::time::Duration::from_millis(exp + jitter)
}

/// Run `op` with bounded retries on transient errors. `label` feeds the log
/// line only; permanent errors return immediately.
pub async fn with_retries<T, F, Fut>(label: &str, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient broker error — backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
