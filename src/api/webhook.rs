// =============================================================================
// Webhook Endpoints — signal ingress over HTTP
// =============================================================================
//
// POST /webhook/tradingview answers inside the 200 ms contract: the pipeline
// validates and enqueues, never waiting on routing or execution. Rejections
// carry `{status: "rejected", reason, code, correlation_id}` with a matching
// HTTP status.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::debug;

use crate::api::ApiContext;
use crate::ingress::{self, IngressOutcome};

/// Signature header TradingView-side senders attach.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /webhook/tradingview
pub async fn tradingview(
    State(ctx): State<Arc<ApiContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let source_ip = addr.ip().to_string();
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = ingress::process(
        &ctx.core,
        &ctx.limiter,
        &source_ip,
        content_type,
        signature,
        &body,
    );

    match outcome {
        IngressOutcome::Received { alert_id, duplicate } => {
            debug!(alert_id = %alert_id, duplicate, "webhook acknowledged");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "received",
                    "alert_id": alert_id,
                })),
            )
        }
        IngressOutcome::Rejected {
            code,
            message,
            correlation_id,
        } => (
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(serde_json::json!({
                "status": "rejected",
                "reason": code,
                "message": message,
                "correlation_id": correlation_id,
            })),
        ),
    }
}

/// GET /webhook/test — health probe.
pub async fn test() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PersistenceConfig};
    use crate::persist::PersistentStore;
    use crate::state::CoreState;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (axum::Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let core = CoreState::new(EngineConfig::default(), persist);
        let ctx = ApiContext::new(core);
        (crate::api::rest::router(ctx), dir)
    }

    fn webhook_request(body: &str) -> Request<axum::body::Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/webhook/tradingview")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.1.2.3:5555".parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn webhook_roundtrip_and_health() {
        let _guard = crate::ingress::TEST_ENV_LOCK.lock();
        let (app, _dir) = app();

        let body = r#"{"symbol":"ES","action":"buy","quantity":1,"account_group":"paper_simulator"}"#;
        let resp = app.clone().oneshot(webhook_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "received");
        assert!(json["alert_id"].as_str().unwrap().len() == 64);

        let probe = Request::builder()
            .method("GET")
            .uri("/webhook/test")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = app.oneshot(probe).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_rejection_shape() {
        let _guard = crate::ingress::TEST_ENV_LOCK.lock();
        let (app, _dir) = app();

        let body = r#"{"symbol":"ES","action":"buy","quantity":-1,"account_group":"x"}"#;
        let resp = app.oneshot(webhook_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "schema_invalid");
        assert!(json["correlation_id"].as_str().is_some());
    }
}
