// =============================================================================
// Ingress — webhook validation pipeline
// =============================================================================
//
// Every inbound webhook passes through, in order: per-IP token bucket,
// payload hygiene (content type, size, deep scan), HMAC transport auth,
// replay window, schema coercion, idempotency, persistence-degradation
// check, and finally the non-blocking enqueue into the router channel.
//
// Every rejection carries a machine-readable code and a correlation id. The
// handler never blocks on downstream execution: a full router queue is a
// back-pressure refusal, not a wait.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{scan_payload, Alert};
use crate::clock;
use crate::events::{self, EventType};
use crate::persist::Stream;
use crate::state::CoreState;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted body size.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
/// Replay window around the optional client `ts` field.
const REPLAY_WINDOW_MINUTES: i64 = 5;
/// Credential scope holding the webhook shared secret.
pub const WEBHOOK_SECRET_SCOPE: &str = "webhook.secret";

/// Serializes tests that read or mutate the webhook-secret env override.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: Mutex<()> = Mutex::new(());

// =============================================================================
// Rejection codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressRejectCode {
    RateLimited,
    BadSignature,
    SchemaInvalid,
    Replay,
    PayloadSuspect,
    QueueFull,
    Degraded,
}

impl IngressRejectCode {
    /// HTTP status the webhook endpoint answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::BadSignature => 401,
            Self::SchemaInvalid | Self::PayloadSuspect | Self::Replay => 400,
            Self::QueueFull | Self::Degraded => 503,
        }
    }
}

/// Outcome of the full ingress pipeline.
#[derive(Debug, Clone)]
pub enum IngressOutcome {
    /// Alert accepted (or a duplicate inside the idempotency window; the
    /// original alert id is returned either way).
    Received { alert_id: String, duplicate: bool },
    Rejected {
        code: IngressRejectCode,
        message: String,
        correlation_id: String,
    },
}

impl IngressOutcome {
    fn rejected(code: IngressRejectCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison examines every
/// byte even after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Verify an `X-Webhook-Signature: sha256=<hex>` header over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), hex_sig.trim().to_lowercase().as_bytes())
}

// =============================================================================
// Rate limiter
// =============================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-source token bucket: `burst` capacity refilled at
/// `rate_per_minute / 60` tokens per second.
pub struct RateLimiter {
    rate_per_minute: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        Self {
            rate_per_minute: rate_per_minute as f64,
            burst: burst.max(1) as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_minute / 60.0).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle long enough to be full again (background task).
    pub fn cleanup(&self) {
        let now = Instant::now();
        let refill_secs = self.burst / (self.rate_per_minute / 60.0).max(1e-9);
        self.buckets.lock().retain(|_, b| {
            now.duration_since(b.last_refill).as_secs_f64() < refill_secs * 2.0
        });
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_minute", &self.rate_per_minute)
            .field("burst", &self.burst)
            .field("sources", &self.buckets.lock().len())
            .finish()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Run the complete ingress pipeline over one webhook request.
pub fn process(
    state: &Arc<CoreState>,
    limiter: &RateLimiter,
    source_ip: &str,
    content_type: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
) -> IngressOutcome {
    let now = Utc::now();

    // ── Rate limit ──────────────────────────────────────────────────────
    if !limiter.allow(source_ip) {
        return IngressOutcome::rejected(
            IngressRejectCode::RateLimited,
            format!("rate limit exceeded for {source_ip}"),
        );
    }

    // ── Payload hygiene: content type and size ──────────────────────────
    match content_type {
        Some(ct) if ct.to_lowercase().contains("application/json") => {}
        _ => {
            return IngressOutcome::rejected(
                IngressRejectCode::PayloadSuspect,
                "content type must be application/json",
            );
        }
    }
    if body.len() > MAX_BODY_BYTES {
        return IngressOutcome::rejected(
            IngressRejectCode::PayloadSuspect,
            format!("body of {} bytes exceeds the 64 KiB limit", body.len()),
        );
    }

    // ── Transport auth ──────────────────────────────────────────────────
    match state.credentials.get(WEBHOOK_SECRET_SCOPE) {
        Some(secret) => {
            let ok = signature
                .map(|sig| verify_signature(&secret, body, sig))
                .unwrap_or(false);
            if !ok {
                return IngressOutcome::rejected(
                    IngressRejectCode::BadSignature,
                    "missing or invalid webhook signature",
                );
            }
        }
        None => {
            warn!(
                source_ip,
                "webhook secret not configured — accepting unsigned request (development mode)"
            );
        }
    }

    // ── Parse ───────────────────────────────────────────────────────────
    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return IngressOutcome::rejected(
                IngressRejectCode::SchemaInvalid,
                format!("body is not valid JSON: {e}"),
            );
        }
    };

    // ── Replay window ───────────────────────────────────────────────────
    if let Some(ts) = Alert::client_ts(&payload) {
        if !clock::within_window(now, ts, REPLAY_WINDOW_MINUTES) {
            return IngressOutcome::rejected(
                IngressRejectCode::Replay,
                format!("client ts {ts} is outside the {REPLAY_WINDOW_MINUTES} minute window"),
            );
        }
    }

    // ── Deep scan ───────────────────────────────────────────────────────
    if let Some(pattern) = scan_payload(&payload) {
        return IngressOutcome::rejected(
            IngressRejectCode::PayloadSuspect,
            format!("payload contains disallowed pattern {pattern:?}"),
        );
    }

    // ── Schema coercion ─────────────────────────────────────────────────
    let alert = match Alert::from_payload(&payload, source_ip, now) {
        Ok(a) => a,
        Err(reason) => {
            return IngressOutcome::rejected(IngressRejectCode::SchemaInvalid, reason);
        }
    };

    // ── Idempotency ─────────────────────────────────────────────────────
    if let Some(seen) = state.dedupe.get(&alert.alert_id, now) {
        info!(
            alert_id = %alert.alert_id,
            "duplicate alert inside idempotency window — returning original result"
        );
        return IngressOutcome::Received {
            alert_id: seen.alert_id,
            duplicate: true,
        };
    }

    // ── Persistence degradation ─────────────────────────────────────────
    if state.persist.degraded_beyond_window() {
        return IngressOutcome::rejected(
            IngressRejectCode::Degraded,
            "persistence degraded — ingestion suspended",
        );
    }

    // ── Enqueue (never blocks) ──────────────────────────────────────────
    if !state.enqueue_alert(alert.clone()) {
        return IngressOutcome::rejected(
            IngressRejectCode::QueueFull,
            "router queue full — retry later",
        );
    }

    state.dedupe.insert(&alert.alert_id, now);
    state.persist.append(Stream::Alerts, &alert);
    state.bus.publish(
        EventType::Alert,
        events::ALERTS_TOPIC,
        serde_json::to_value(&alert).unwrap_or_default(),
    );

    info!(
        alert_id = %alert.alert_id,
        symbol = %alert.symbol,
        action = %alert.action,
        account_group = %alert.account_group,
        "alert accepted"
    );

    IngressOutcome::Received {
        alert_id: alert.alert_id,
        duplicate: false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PersistenceConfig};
    use crate::persist::PersistentStore;
    use std::time::Duration;

    use super::TEST_ENV_LOCK as ENV_LOCK;

    fn core() -> (Arc<CoreState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        (CoreState::new(EngineConfig::default(), persist), dir)
    }

    fn body(json: &str) -> Vec<u8> {
        json.as_bytes().to_vec()
    }

    const GOOD: &str = r#"{"symbol":"ES","action":"buy","quantity":1,"order_type":"market","account_group":"paper_simulator","strategy":"new_ma"}"#;

    #[test]
    fn token_bucket_burst_then_refill() {
        let limiter = RateLimiter::new(60, 5);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("1.2.3.4", t0));
        }
        assert!(!limiter.allow_at("1.2.3.4", t0));

        // 60/min = 1 token per second.
        assert!(limiter.allow_at("1.2.3.4", t0 + Duration::from_secs(1)));
        assert!(!limiter.allow_at("1.2.3.4", t0 + Duration::from_millis(1100)));

        // Other sources are independent.
        assert!(limiter.allow_at("5.6.7.8", t0));
    }

    #[test]
    fn signature_verification() {
        let secret = "tv-secret";
        let payload = b"{\"symbol\":\"ES\"}";

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let good = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, payload, &good));
        assert!(!verify_signature(secret, payload, "sha256=deadbeef"));
        assert!(!verify_signature(secret, payload, "md5=abc"));
        assert!(!verify_signature("other-secret", payload, &good));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn pipeline_accepts_and_dedupes() {
        let _guard = ENV_LOCK.lock();
        let (state, _dir) = core();
        let limiter = RateLimiter::new(50, 10);

        let first = process(
            &state,
            &limiter,
            "10.0.0.1",
            Some("application/json"),
            None,
            &body(GOOD),
        );
        let alert_id = match first {
            IngressOutcome::Received { alert_id, duplicate } => {
                assert!(!duplicate);
                alert_id
            }
            other => panic!("{other:?}"),
        };

        // Identical body: same alert id, flagged duplicate, no second enqueue.
        let second = process(
            &state,
            &limiter,
            "10.0.0.2",
            Some("application/json"),
            None,
            &body(GOOD),
        );
        match second {
            IngressOutcome::Received { alert_id: id2, duplicate } => {
                assert!(duplicate);
                assert_eq!(id2, alert_id);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(state.persist.replay(Stream::Alerts).unwrap().len(), 1);
    }

    #[test]
    fn pipeline_rejects_bad_content_type_and_size() {
        let _guard = ENV_LOCK.lock();
        let (state, _dir) = core();
        let limiter = RateLimiter::new(50, 10);

        match process(&state, &limiter, "ip", Some("text/plain"), None, &body(GOOD)) {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::PayloadSuspect)
            }
            other => panic!("{other:?}"),
        }

        let huge = vec![b'x'; MAX_BODY_BYTES + 1];
        match process(&state, &limiter, "ip", Some("application/json"), None, &huge) {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::PayloadSuspect)
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pipeline_rejects_suspect_and_invalid_payloads() {
        let _guard = ENV_LOCK.lock();
        let (state, _dir) = core();
        let limiter = RateLimiter::new(50, 10);

        let sus = r#"{"symbol":"ES","action":"buy","quantity":1,"account_group":"paper_simulator","comment":"<script>x</script>"}"#;
        match process(&state, &limiter, "ip", Some("application/json"), None, &body(sus)) {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::PayloadSuspect)
            }
            other => panic!("{other:?}"),
        }

        let bad = r#"{"symbol":"ES","action":"buy","quantity":0,"account_group":"x"}"#;
        match process(&state, &limiter, "ip", Some("application/json"), None, &body(bad)) {
            IngressOutcome::Rejected { code, correlation_id, .. } => {
                assert_eq!(code, IngressRejectCode::SchemaInvalid);
                assert!(!correlation_id.is_empty());
            }
            other => panic!("{other:?}"),
        }

        match process(&state, &limiter, "ip", Some("application/json"), None, b"not json") {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::SchemaInvalid)
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pipeline_rejects_stale_timestamps() {
        let _guard = ENV_LOCK.lock();
        let (state, _dir) = core();
        let limiter = RateLimiter::new(50, 10);

        let stale = format!(
            r#"{{"symbol":"ES","action":"buy","quantity":1,"account_group":"paper_simulator","ts":"{}"}}"#,
            (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339()
        );
        match process(&state, &limiter, "ip", Some("application/json"), None, stale.as_bytes()) {
            IngressOutcome::Rejected { code, .. } => assert_eq!(code, IngressRejectCode::Replay),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pipeline_enforces_signature_when_secret_configured() {
        let _guard = ENV_LOCK.lock();
        let (state, _dir) = core();
        let limiter = RateLimiter::new(50, 10);

        std::env::set_var("TT_CRED_WEBHOOK_SECRET", "tv-secret");

        // Unsigned and wrongly signed requests fail.
        match process(&state, &limiter, "ip", Some("application/json"), None, &body(GOOD)) {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::BadSignature)
            }
            other => panic!("{other:?}"),
        }

        // Correctly signed request passes.
        let mut mac = HmacSha256::new_from_slice(b"tv-secret").unwrap();
        mac.update(GOOD.as_bytes());
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let outcome = process(
            &state,
            &limiter,
            "ip",
            Some("application/json"),
            Some(&sig),
            &body(GOOD),
        );
        std::env::remove_var("TT_CRED_WEBHOOK_SECRET");

        assert!(matches!(outcome, IngressOutcome::Received { .. }));
    }

    #[test]
    fn queue_full_is_backpressure() {
        let _guard = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let mut config = EngineConfig::default();
        config.ingress.router_queue_capacity = 1;
        let state = CoreState::new(config, persist);
        let limiter = RateLimiter::new(50, 10);

        let a = r#"{"symbol":"ES","action":"buy","quantity":1,"account_group":"paper_simulator"}"#;
        let b = r#"{"symbol":"NQ","action":"buy","quantity":1,"account_group":"paper_simulator"}"#;

        assert!(matches!(
            process(&state, &limiter, "ip", Some("application/json"), None, &body(a)),
            IngressOutcome::Received { .. }
        ));
        match process(&state, &limiter, "ip", Some("application/json"), None, &body(b)) {
            IngressOutcome::Rejected { code, .. } => {
                assert_eq!(code, IngressRejectCode::QueueFull);
                assert_eq!(code.http_status(), 503);
            }
            other => panic!("{other:?}"),
        }
    }
}
