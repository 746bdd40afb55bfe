// =============================================================================
// Alert — canonical ingress record
// =============================================================================
//
// An Alert is the immutable, validated form of a webhook payload. The id is
// the hex SHA-256 of the canonical payload (serde_json sorts object keys), so
// identical retries map to the same Alert and are suppressed by the dedupe
// cache instead of producing a second order.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{AlertAction, OrderType};

/// Payload fields the schema knows about; everything else lands in `extras`.
const KNOWN_FIELDS: &[&str] = &[
    "symbol",
    "action",
    "quantity",
    "order_type",
    "price",
    "stop_price",
    "account_group",
    "strategy",
    "timeframe",
    "comment",
    "ts",
];

/// Canonicalized, validated trading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub received_at: DateTime<Utc>,
    pub source_ip: String,
    pub symbol: String,
    pub action: AlertAction,
    pub quantity: f64,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub account_group: String,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Unknown payload fields, retained verbatim for audit.
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
    /// Hex SHA-256 of the canonical payload.
    pub payload_hash: String,
}

impl Alert {
    /// Coerce a parsed webhook payload into the canonical shape.
    ///
    /// Returns a human-readable reason on failure; the caller maps it to the
    /// `schema_invalid` rejection code.
    pub fn from_payload(
        payload: &serde_json::Value,
        source_ip: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Self, String> {
        let obj = payload
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;

        let symbol = string_field(obj, "symbol")?
            .trim()
            .to_uppercase();
        if symbol.is_empty() {
            return Err("symbol must be non-empty".into());
        }

        let action: AlertAction = obj
            .get("action")
            .cloned()
            .ok_or_else(|| "missing field: action".to_string())
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|_| "action must be one of buy|sell|close|exit".to_string())
            })?;

        let quantity = numeric_field(obj, "quantity")?;
        if !(quantity > 0.0) || !quantity.is_finite() {
            return Err(format!("quantity must be > 0, got {quantity}"));
        }

        let order_type: OrderType = match obj.get("order_type") {
            None | Some(serde_json::Value::Null) => OrderType::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| "order_type must be one of market|limit|stop|stop_limit".to_string())?,
        };

        let price = optional_numeric(obj, "price")?;
        let stop_price = optional_numeric(obj, "stop_price")?;

        match order_type {
            OrderType::Limit if price.is_none() => {
                return Err("limit orders require a price".into());
            }
            OrderType::Stop if stop_price.is_none() => {
                return Err("stop orders require a stop_price".into());
            }
            OrderType::StopLimit if price.is_none() || stop_price.is_none() => {
                return Err("stop_limit orders require price and stop_price".into());
            }
            _ => {}
        }

        let account_group = string_field(obj, "account_group")?.trim().to_string();
        if account_group.is_empty() {
            return Err("account_group must be non-empty".into());
        }

        let strategy_id = optional_string(obj, "strategy");
        let timeframe = optional_string(obj, "timeframe");
        let comment = optional_string(obj, "comment");

        let mut extras = serde_json::Map::new();
        for (k, v) in obj {
            if !KNOWN_FIELDS.contains(&k.as_str()) {
                extras.insert(k.clone(), v.clone());
            }
        }

        let payload_hash = canonical_hash(payload);

        Ok(Self {
            alert_id: payload_hash.clone(),
            received_at,
            source_ip: source_ip.to_string(),
            symbol,
            action,
            quantity,
            order_type,
            price,
            stop_price,
            account_group,
            strategy_id,
            timeframe,
            comment,
            extras,
            payload_hash,
        })
    }

    /// Optional client timestamp for replay rejection.
    pub fn client_ts(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
        match payload.get("ts") {
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            Some(serde_json::Value::Number(n)) => {
                // Epoch seconds or milliseconds; anything past year 2603 in
                // seconds is treated as millis.
                let raw = n.as_i64()?;
                let (secs, ms) = if raw > 20_000_000_000 {
                    (raw / 1000, (raw % 1000) as u32)
                } else {
                    (raw, 0)
                };
                DateTime::from_timestamp(secs, ms * 1_000_000)
            }
            _ => None,
        }
    }
}

/// Hex SHA-256 of the payload serialized with sorted object keys.
pub fn canonical_hash(payload: &serde_json::Value) -> String {
    let canonical = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Payload hygiene
// =============================================================================

/// Substrings that disqualify a payload outright when found in any string
/// field: script injection, SQL comment sequences, shell metacharacters.
const SUSPECT_PATTERNS: &[&str] = &["<script", "</script", "--", "/*", "*/", "$(", "`", ";", "|", "&"];

/// Recursively scan every string value in the payload. Returns the first
/// offending pattern, or `None` when the payload is clean.
pub fn scan_payload(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::String(s) => {
            let lower = s.to_lowercase();
            SUSPECT_PATTERNS.iter().find(|p| lower.contains(**p)).copied()
        }
        serde_json::Value::Array(items) => items.iter().find_map(scan_payload),
        serde_json::Value::Object(map) => map.values().find_map(scan_payload),
        _ => None,
    }
}

// =============================================================================
// Dedupe cache
// =============================================================================

/// Remembered outcome of a previously ingested alert.
#[derive(Debug, Clone)]
pub struct SeenAlert {
    pub alert_id: String,
    pub first_seen: DateTime<Utc>,
    /// Order produced by the first ingestion, if routing succeeded.
    pub order_id: Option<String>,
}

/// 24-hour idempotency window over alert ids. Two submissions of the same
/// payload inside the window produce exactly one order.
pub struct DedupeCache {
    window: Duration,
    seen: RwLock<HashMap<String, SeenAlert>>,
}

impl DedupeCache {
    pub fn new(window_hours: i64) -> Self {
        Self {
            window: Duration::hours(window_hours),
            seen: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a prior ingestion of `alert_id` still inside the window.
    pub fn get(&self, alert_id: &str, now: DateTime<Utc>) -> Option<SeenAlert> {
        let seen = self.seen.read();
        seen.get(alert_id)
            .filter(|s| now.signed_duration_since(s.first_seen) <= self.window)
            .cloned()
    }

    /// Record a fresh ingestion. Returns false if the id was already present
    /// (lost race between two identical in-flight requests).
    pub fn insert(&self, alert_id: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.write();
        if let Some(existing) = seen.get(alert_id) {
            if now.signed_duration_since(existing.first_seen) <= self.window {
                return false;
            }
        }
        seen.insert(
            alert_id.to_string(),
            SeenAlert {
                alert_id: alert_id.to_string(),
                first_seen: now,
                order_id: None,
            },
        );
        true
    }

    /// Attach the order produced by routing to the cached entry.
    pub fn record_order(&self, alert_id: &str, order_id: &str) {
        if let Some(entry) = self.seen.write().get_mut(alert_id) {
            entry.order_id = Some(order_id.to_string());
        }
    }

    /// Drop entries older than the window (call from a background task).
    pub fn cleanup(&self, now: DateTime<Utc>) {
        self.seen
            .write()
            .retain(|_, s| now.signed_duration_since(s.first_seen) <= self.window);
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }
}

impl std::fmt::Debug for DedupeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeCache")
            .field("window", &self.window)
            .field("entries", &self.seen.read().len())
            .finish()
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn string_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Result<String, String> {
    obj.get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("missing or non-string field: {name}"))
}

fn optional_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Option<String> {
    obj.get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Accept numbers or numeric strings (TradingView emits both).
fn numeric_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Result<f64, String> {
    match obj.get(name) {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| format!("field {name} is not representable as f64")),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| format!("field {name} is not numeric: {s:?}")),
        Some(_) => Err(format!("field {name} must be numeric")),
        None => Err(format!("missing field: {name}")),
    }
}

fn optional_numeric(
    obj: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Result<Option<f64>, String> {
    match obj.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => numeric_field(obj, name).map(Some),
    }
}
