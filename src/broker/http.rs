// =============================================================================
// HTTP Broker Adapter — signed REST + streaming fills for live/sandbox feeds
// =============================================================================
//
// One implementation serves every live feed (tradovate, tastytrade, schwab,
// topstepx); each instance is parameterized with the feed's base URL, fill
// stream URL, and credential scope. Requests are HMAC-SHA256 signed; the
// secret never appears in logs or query strings.
//
// Transient failures (5xx, timeout, connection errors) go through the shared
// backoff-with-jitter retry loop. Submits are safe to retry because the body
// carries the (account_id, alert_id) idempotency key the venue dedupes on.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{
    with_retries, AccountSnapshot, AdapterHealth, BrokerAdapter, BrokerError, CancelOutcome,
    SubmitAck,
};
use crate::credentials::CredentialStore;
use crate::orders::{Fill, Order};

type HmacSha256 = Hmac<Sha256>;

/// Per-request timeout; the router's dispatch budget sits above this.
const REQUEST_TIMEOUT_SECS: u64 = 10;
/// Delay between fill-stream reconnect attempts.
const STREAM_RECONNECT_SECS: u64 = 5;
/// Fill channel capacity per subscription.
const FILL_CHANNEL_CAPACITY: usize = 512;

/// A live or sandbox execution feed speaking signed REST plus a fill
/// WebSocket.
pub struct HttpBrokerAdapter {
    feed: String,
    base_url: String,
    stream_url: String,
    api_key: String,
    secret: String,
    client: reqwest::Client,
    health: RwLock<AdapterHealth>,
}

impl HttpBrokerAdapter {
    /// Build an adapter for `feed`, pulling `<feed>.api_key` and
    /// `<feed>.api_secret` from the credential store. Feeds without
    /// credentials still construct (they report unhealthy and reject
    /// traffic), so a partially configured engine boots.
    pub fn from_credentials(
        feed: &str,
        base_url: &str,
        stream_url: &str,
        credentials: &Arc<CredentialStore>,
    ) -> Self {
        let api_key = credentials.get(&format!("{feed}.api_key")).unwrap_or_default();
        let secret = credentials
            .get(&format!("{feed}.api_secret"))
            .unwrap_or_default();

        if api_key.is_empty() || secret.is_empty() {
            warn!(feed, "feed credentials missing — adapter will reject traffic");
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!(feed, base_url, "HTTP broker adapter initialised");

        Self {
            feed: feed.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_url: stream_url.to_string(),
            api_key,
            secret,
            client,
            health: RwLock::new(AdapterHealth::default()),
        }
    }

    /// HMAC-SHA256 hex signature over the request payload.
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn require_credentials(&self) -> Result<(), BrokerError> {
        if self.api_key.is_empty() || self.secret.is_empty() {
            return Err(BrokerError::Permanent(format!(
                "feed {} has no credentials configured",
                self.feed
            )));
        }
        Ok(())
    }

    fn mark_ok(&self) {
        let mut h = self.health.write();
        h.connected = true;
        h.last_ok = Some(Utc::now());
        h.last_error = None;
    }

    fn mark_error(&self, error: &BrokerError) {
        let mut h = self.health.write();
        h.connected = false;
        h.last_error = Some(error.message().to_string());
    }

    /// Send one signed request and classify the outcome.
    async fn signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let ts = Utc::now().timestamp_millis();
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&format!("{ts}{path}{body_text}"));

        let mut req = self
            .client
            .request(method, &url)
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", ts.to_string())
            .header("X-Signature", signature);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                BrokerError::Transient(format!("{url}: {e}"))
            } else {
                BrokerError::Permanent(format!("{url}: {e}"))
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Transient(format!("{url}: body read failed: {e}")))?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                BrokerError::Permanent(format!("{url}: unparseable response: {e}"))
            })
        } else {
            Err(classify_status(status, &url, &text))
        }
    }
}

/// 5xx and 429 retry; everything else is terminal.
fn classify_status(status: StatusCode, url: &str, body: &str) -> BrokerError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BrokerError::Transient(format!("{url} returned {status}: {body}"))
    } else {
        BrokerError::Permanent(format!("{url} returned {status}: {body}"))
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireAck {
    order_id: String,
    status: crate::types::OrderStatus,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFlatten {
    closed: usize,
}

/// Parse one fill-stream message. The stream speaks our Fill shape directly.
fn parse_fill(text: &str) -> Result<Fill, serde_json::Error> {
    serde_json::from_str(text)
}

// =============================================================================
// BrokerAdapter implementation
// =============================================================================

#[async_trait]
impl BrokerAdapter for HttpBrokerAdapter {
    fn name(&self) -> &str {
        &self.feed
    }

    async fn submit(&self, order: &Order) -> Result<SubmitAck, BrokerError> {
        self.require_credentials()?;

        let body = serde_json::json!({
            "account_id": order.account_id,
            // Idempotency key: the venue dedupes on (account_id, alert_id).
            "alert_id": order.alert_id,
            "client_order_id": order.order_id,
            "symbol": order.symbol,
            "side": order.side,
            "qty": order.qty,
            "order_type": order.order_type,
            "limit_price": order.limit_price,
            "stop_price": order.stop_price,
        });

        let result = with_retries(&format!("{}::submit", self.feed), || {
            self.signed_request::<WireAck>(reqwest::Method::POST, "/v1/orders", Some(&body))
        })
        .await;

        match result {
            Ok(ack) => {
                self.mark_ok();
                info!(
                    feed = %self.feed,
                    order_id = %ack.order_id,
                    status = %ack.status,
                    "order submitted to feed"
                );
                Ok(SubmitAck {
                    order_id: ack.order_id,
                    status: ack.status,
                    reason: ack.reason,
                })
            }
            Err(e) => {
                self.mark_error(&e);
                Err(e)
            }
        }
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError> {
        self.require_credentials()?;

        let path = format!("/v1/orders/{order_id}");
        let result = with_retries(&format!("{}::cancel", self.feed), || {
            self.signed_request::<serde_json::Value>(reqwest::Method::DELETE, &path, None)
        })
        .await;

        match result {
            Ok(_) => {
                self.mark_ok();
                Ok(CancelOutcome::Ok)
            }
            Err(BrokerError::Permanent(msg)) if msg.contains("404") => {
                self.mark_ok();
                Ok(CancelOutcome::NotFound)
            }
            Err(BrokerError::Permanent(msg)) if msg.contains("409") => {
                self.mark_ok();
                Ok(CancelOutcome::AlreadyTerminal)
            }
            Err(e) => {
                self.mark_error(&e);
                Err(e)
            }
        }
    }

    async fn flatten(&self, account_id: &str) -> Result<usize, BrokerError> {
        self.require_credentials()?;

        let path = format!("/v1/accounts/{account_id}/flatten");
        let empty_body = serde_json::json!({});
        let result = with_retries(&format!("{}::flatten", self.feed), || {
            self.signed_request::<WireFlatten>(
                reqwest::Method::POST,
                &path,
                Some(&empty_body),
            )
        })
        .await;

        match result {
            Ok(r) => {
                self.mark_ok();
                info!(feed = %self.feed, account_id, closed = r.closed, "positions flattened");
                Ok(r.closed)
            }
            Err(e) => {
                self.mark_error(&e);
                Err(e)
            }
        }
    }

    async fn subscribe_fills(
        &self,
        account_id: &str,
        last_seen_fill_id: Option<String>,
    ) -> Result<mpsc::Receiver<Fill>, BrokerError> {
        self.require_credentials()?;

        let (tx, rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
        let feed = self.feed.clone();
        let account = account_id.to_string();
        let mut resume_after = last_seen_fill_id;
        let url_base = self.stream_url.clone();

        tokio::spawn(async move {
            loop {
                let url = match &resume_after {
                    Some(id) => format!("{url_base}?account={account}&after={id}"),
                    None => format!("{url_base}?account={account}"),
                };

                match run_fill_stream(&feed, &url, &tx, &mut resume_after).await {
                    Ok(()) => {
                        info!(feed = %feed, account = %account, "fill stream closed by peer");
                    }
                    Err(e) => {
                        error!(
                            feed = %feed,
                            account = %account,
                            error = %e,
                            "fill stream error — reconnecting in 5s"
                        );
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(STREAM_RECONNECT_SECS)).await;
            }
        });

        Ok(rx)
    }

    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot, BrokerError> {
        self.require_credentials()?;

        let path = format!("/v1/accounts/{account_id}");
        let result = with_retries(&format!("{}::snapshot", self.feed), || {
            self.signed_request::<AccountSnapshot>(reqwest::Method::GET, &path, None)
        })
        .await;

        match result {
            Ok(snap) => {
                self.mark_ok();
                Ok(snap)
            }
            Err(e) => {
                self.mark_error(&e);
                Err(e)
            }
        }
    }

    fn health(&self) -> AdapterHealth {
        self.health.read().clone()
    }
}

/// Connect to the fill WebSocket and forward parsed fills until the stream
/// ends. Tracks the resume cursor so the reconnect picks up where it left
/// off.
async fn run_fill_stream(
    feed: &str,
    url: &str,
    tx: &mpsc::Sender<Fill>,
    resume_after: &mut Option<String>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .context("failed to connect to fill stream")?;
    info!(feed, "fill stream connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_fill(&text) {
                    Ok(fill) => {
                        *resume_after = Some(fill.fill_id.clone());
                        if tx.send(fill).await.is_err() {
                            // Subscriber dropped; stop the stream task.
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(feed, error = %e, "unparseable fill message skipped");
                    }
                }
            }
            Some(Ok(_)) => {
                // Pings and binary frames are handled by the library / ignored.
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

impl std::fmt::Debug for HttpBrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBrokerAdapter")
            .field("feed", &self.feed)
            .field("base_url", &self.base_url)
            .field("has_credentials", &(!self.api_key.is_empty()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HttpBrokerAdapter {
        let creds = Arc::new(CredentialStore::with_path("/nonexistent/creds.json"));
        std::env::set_var("TT_CRED_TRADOVATE_API_KEY", "key-1");
        std::env::set_var("TT_CRED_TRADOVATE_API_SECRET", "secret-1");
        let a = HttpBrokerAdapter::from_credentials(
            "tradovate",
            "https://api.example.test/",
            "wss://stream.example.test/fills",
            &creds,
        );
        std::env::remove_var("TT_CRED_TRADOVATE_API_KEY");
        std::env::remove_var("TT_CRED_TRADOVATE_API_SECRET");
        a
    }

    #[test]
    fn signing_is_deterministic_and_keyed() {
        let a = adapter();
        let s1 = a.sign("1718193600/v1/orders{}");
        let s2 = a.sign("1718193600/v1/orders{}");
        let s3 = a.sign("1718193601/v1/orders{}");
        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
        assert_eq!(s1.len(), 64);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let a = adapter();
        assert_eq!(a.base_url, "https://api.example.test");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "u", "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "u", "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "u", "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "u", "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "u", "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "u", "").is_transient());
    }

    #[test]
    fn parse_fill_round_trip() {
        let text = r#"{
            "fill_id": "f-1",
            "order_id": "o-1",
            "account_id": "TS50K001",
            "symbol": "ES",
            "side": "buy",
            "qty": 1.0,
            "price": 5000.25,
            "commission": 2.25,
            "fees": 1.40,
            "ts": "2024-06-12T15:00:00Z"
        }"#;
        let fill = parse_fill(text).unwrap();
        assert_eq!(fill.fill_id, "f-1");
        assert_eq!(fill.symbol, "ES");
        assert_eq!(fill.qty, 1.0);
        assert_eq!(fill.position_after, None);
    }

    #[tokio::test]
    async fn missing_credentials_reject_without_io() {
        let creds = Arc::new(CredentialStore::with_path("/nonexistent/creds.json"));
        let a = HttpBrokerAdapter::from_credentials(
            "schwab",
            "https://api.example.test",
            "wss://stream.example.test",
            &creds,
        );
        let order = crate::orders::new_order(
            "alert-1",
            "acct",
            "main",
            "schwab",
            "ES",
            crate::types::OrderSide::Buy,
            1.0,
            crate::types::OrderType::Market,
            None,
            None,
            None,
        );
        let err = a.submit(&order).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(!a.health().connected);
    }
}
