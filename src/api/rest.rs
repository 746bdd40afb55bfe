// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Control and query surface of the routing engine. Manual order entry routes
// through the identical pipeline as webhook alerts, so risk policy and mode
// overlays apply uniformly.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::alert::Alert;
use crate::api::ApiContext;
use crate::broker::{BrokerAdapter, CancelOutcome};
use crate::events::{self, EventType};
use crate::persist::Stream;
use crate::router::{route_alert, RouteOutcome};
use crate::types::{OrderStatus, StrategyMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full HTTP router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Webhook ingress ─────────────────────────────────────────
        .route("/webhook/tradingview", post(crate::api::webhook::tradingview))
        .route("/webhook/test", get(crate::api::webhook::test))
        // ── Accounts ────────────────────────────────────────────────
        .route("/api/accounts", get(accounts))
        .route("/api/accounts/:feed/:acct/positions", get(account_positions))
        // ── Orders ──────────────────────────────────────────────────
        .route("/api/orders", get(orders).post(create_order))
        .route("/api/orders/:id", get(order_by_id).delete(cancel_order))
        // ── Funded accounts ─────────────────────────────────────────
        .route("/api/funded-accounts", get(funded_accounts))
        .route(
            "/api/funded-accounts/:provider/:acct/flatten-positions",
            post(flatten_positions),
        )
        .route("/api/funded-accounts/:acct/pause", post(pause_account))
        .route("/api/funded-accounts/:acct/resume", post(resume_account))
        // ── Paper trading ───────────────────────────────────────────
        .route("/api/paper-trading/accounts/:id/reset", post(reset_paper_account))
        // ── Strategies ──────────────────────────────────────────────
        .route("/api/strategies/summaries", get(strategy_summaries))
        .route("/api/strategies/:id/mode", post(set_strategy_mode))
        // ── Status & stream ─────────────────────────────────────────
        .route("/api/status", get(status))
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

// =============================================================================
// Accounts
// =============================================================================

async fn accounts(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let mut out = Vec::new();
    for id in ctx.core.sim.account_ids() {
        if let Ok(snap) = ctx.core.sim.account_snapshot(&id).await {
            let mode = ctx
                .core
                .sim
                .account(&id)
                .map(|a| format!("{:?}", a.mode).to_lowercase())
                .unwrap_or_default();
            out.push(serde_json::json!({
                "id": snap.account_id,
                "kind": "paper",
                "mode": mode,
                "balance": snap.balance,
                "equity": snap.equity,
                "day_pnl": snap.day_pnl,
                "open_positions": snap.positions.len(),
            }));
        }
    }
    Json(out)
}

async fn account_positions(
    State(ctx): State<Arc<ApiContext>>,
    Path((feed, acct)): Path<(String, String)>,
) -> axum::response::Response {
    let Some(adapter) = ctx.core.adapters.get(&feed) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown feed {feed:?}"));
    };
    match adapter.account_snapshot(&acct).await {
        Ok(snap) => Json(snap.positions).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.message().to_string()),
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct OrdersQuery {
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    open_only: Option<bool>,
}

async fn orders(
    State(ctx): State<Arc<ApiContext>>,
    Query(q): Query<OrdersQuery>,
) -> impl IntoResponse {
    let list = if q.open_only.unwrap_or(false) {
        ctx.core.orders.open(q.account.as_deref())
    } else {
        let mut all = ctx.core.orders.recent(q.limit.unwrap_or(100));
        if let Some(account) = &q.account {
            all.retain(|o| &o.account_id == account);
        }
        all
    };
    Json(list)
}

async fn order_by_id(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match ctx.core.orders.get(&id) {
        Some(order) => Json(order).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown order {id:?}")),
    }
}

/// Manual order entry: body matches the webhook payload shape and flows
/// through the same router pipeline.
async fn create_order(
    State(ctx): State<Arc<ApiContext>>,
    Json(payload): Json<serde_json::Value>,
) -> axum::response::Response {
    let alert = match Alert::from_payload(&payload, "api", Utc::now()) {
        Ok(a) => a,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, reason),
    };

    // Manual entries share the idempotency window with webhook alerts.
    if let Some(seen) = ctx.core.dedupe.get(&alert.alert_id, Utc::now()) {
        if let Some(order_id) = seen.order_id {
            if let Some(order) = ctx.core.orders.get(&order_id) {
                return (StatusCode::OK, Json(order)).into_response();
            }
        }
    }
    ctx.core.dedupe.insert(&alert.alert_id, alert.received_at);
    ctx.core.persist.append(Stream::Alerts, &alert);
    ctx.core.bus.publish(
        EventType::Alert,
        events::ALERTS_TOPIC,
        serde_json::to_value(&alert).unwrap_or_default(),
    );

    match route_alert(&ctx.core, &alert).await {
        RouteOutcome::Dispatched(order) => (StatusCode::CREATED, Json(order)).into_response(),
        RouteOutcome::Rejected { code, message } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "status": "rejected",
                "reason": code,
                "message": message,
            })),
        )
            .into_response(),
    }
}

async fn cancel_order(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Some(order) = ctx.core.orders.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown order {id:?}"));
    };
    let Some(adapter) = ctx.core.adapters.get(&order.backend) else {
        return error_response(
            StatusCode::BAD_GATEWAY,
            format!("no adapter for backend {:?}", order.backend),
        );
    };

    match adapter.cancel(&id).await {
        Ok(CancelOutcome::Ok) => {
            let updated =
                ctx.core
                    .orders
                    .set_status(&id, OrderStatus::Cancelled, Some("cancelled via API"));
            if let Some(o) = &updated {
                ctx.core.persist.append(Stream::Orders, o);
                ctx.core.bus.publish(
                    EventType::Order,
                    &events::orders_topic(&o.account_id),
                    serde_json::to_value(o).unwrap_or_default(),
                );
            }
            info!(order_id = %id, "order cancelled via API");
            Json(serde_json::json!({ "status": "cancelled", "order_id": id })).into_response()
        }
        Ok(CancelOutcome::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "order unknown at the backend")
        }
        Ok(CancelOutcome::AlreadyTerminal) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "already_terminal",
                "order_id": id,
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.message().to_string()),
    }
}

// =============================================================================
// Funded accounts
// =============================================================================

async fn funded_accounts(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let config = ctx.core.config.read();
    let out: Vec<serde_json::Value> = config
        .account_groups
        .iter()
        .filter(|g| g.risk_profile.is_some())
        .map(|g| {
            let state = ctx.core.funded.state(g.account_id());
            serde_json::json!({
                "account_group": g.key,
                "account_id": g.account_id(),
                "backend": g.backend,
                "status": state.status,
                "daily_pnl": state.daily_pnl,
                "equity": state.equity,
                "peak_equity": state.peak_equity,
                "open_positions": state.open_positions,
                "rules": g.risk_profile,
                "violations": ctx.core.funded.violations(Some(g.account_id())),
            })
        })
        .collect();
    Json(out)
}

async fn flatten_positions(
    State(ctx): State<Arc<ApiContext>>,
    Path((provider, acct)): Path<(String, String)>,
) -> axum::response::Response {
    let Some(adapter) = ctx.core.adapters.get(&provider) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown feed {provider:?}"));
    };

    match adapter.flatten(&acct).await {
        Ok(closed) => {
            warn!(provider = %provider, account = %acct, closed, "flatten requested via API");
            ctx.core.publish_account_update(&acct);
            Json(serde_json::json!({ "status": "flattened", "positions_closed": closed }))
                .into_response()
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.message().to_string()),
    }
}

/// Pause: an active account pauses directly; a violated account is
/// acknowledged into paused.
async fn pause_account(
    State(ctx): State<Arc<ApiContext>>,
    Path(acct): Path<String>,
) -> axum::response::Response {
    let state = ctx.core.funded.state(&acct);
    let result = match state.status {
        crate::types::AccountStatus::Violated => ctx.core.funded.acknowledge(&acct),
        _ => Ok(ctx.core.funded.pause(&acct)),
    };
    match result {
        Ok(s) => Json(serde_json::json!({ "account_id": acct, "status": s.status })).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

async fn resume_account(
    State(ctx): State<Arc<ApiContext>>,
    Path(acct): Path<String>,
) -> axum::response::Response {
    match ctx.core.funded.resume(&acct) {
        Ok(s) => Json(serde_json::json!({ "account_id": acct, "status": s.status })).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

// =============================================================================
// Paper trading
// =============================================================================

async fn reset_paper_account(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match ctx.core.sim.reset(&id) {
        Ok(account) => {
            if let Err(e) = ctx
                .core
                .persist
                .write_snapshot(&format!("account-{id}"), &account)
            {
                warn!(error = %e, "reset snapshot write failed");
            }
            ctx.core.publish_account_update(&id);
            info!(account = %id, "paper account reset via API");
            Json(serde_json::json!({
                "status": "reset",
                "account_id": id,
                "balance": account.balance,
            }))
            .into_response()
        }
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// =============================================================================
// Strategies
// =============================================================================

async fn strategy_summaries(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.core.tracker.summaries())
}

#[derive(Deserialize)]
struct ModeRequest {
    new_mode: StrategyMode,
    #[serde(default)]
    requested_by: Option<String>,
}

async fn set_strategy_mode(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> axum::response::Response {
    let requested_by = req.requested_by.as_deref().unwrap_or("api");
    match ctx.core.tracker.set_mode(&id, req.new_mode, requested_by) {
        Ok(transition) => {
            ctx.core.persist.append(Stream::ModeTransitions, &transition);
            ctx.core.bus.publish(
                EventType::StrategyModeChange,
                &events::strategies_topic(&id),
                serde_json::to_value(&transition).unwrap_or_default(),
            );
            if let Some(strategy) = ctx.core.tracker.get(&id) {
                let _ = ctx
                    .core
                    .persist
                    .write_snapshot(&format!("strategy-{id}"), &strategy);
            }
            Json(transition).into_response()
        }
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

// =============================================================================
// Status
// =============================================================================

async fn status(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.core.status_snapshot())
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
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<ApiContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let core = CoreState::new(EngineConfig::default(), persist);
        let ctx = ApiContext::new(core);
        (router(ctx.clone()), ctx, dir)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn accounts_and_status_endpoints() {
        let (app, _ctx, _dir) = app();

        let (status, accounts) = get_json(&app, "/api/accounts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accounts[0]["id"], "sim-001");
        assert_eq!(accounts[0]["balance"], 100_000.0);

        let (status, body) = get_json(&app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["feeds"]["simulator"]["connected"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn manual_order_routes_like_a_webhook() {
        let (app, ctx, _dir) = app();
        ctx.core.quotes.apply_trade("ES", 5000.0, Utc::now());

        let (status, order) = post_json(
            &app,
            "/api/orders",
            serde_json::json!({
                "symbol": "ES",
                "action": "buy",
                "quantity": 1,
                "order_type": "market",
                "account_group": "paper_simulator",
                "strategy": "manual_test",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["backend"], "simulator");

        let order_id = order["order_id"].as_str().unwrap();
        let (status, fetched) = get_json(&app, &format!("/api/orders/{order_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["order_id"], order["order_id"]);

        // Unknown order id is a 404.
        let (status, _) = get_json(&app, "/api/orders/no-such-order").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_order_rejection_shape() {
        let (app, _ctx, _dir) = app();
        let (status, body) = post_json(
            &app,
            "/api/orders",
            serde_json::json!({
                "symbol": "ES",
                "action": "buy",
                "quantity": 1,
                "account_group": "nope",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"], "unknown_account_group");
    }

    #[tokio::test]
    async fn paper_reset_endpoint() {
        let (app, ctx, _dir) = app();
        ctx.core.quotes.apply_trade("ES", 5000.0, Utc::now());

        // Trade something first so the reset is observable.
        let _ = post_json(
            &app,
            "/api/orders",
            serde_json::json!({
                "symbol": "ES",
                "action": "buy",
                "quantity": 1,
                "account_group": "paper_simulator",
            }),
        )
        .await;
        assert!(ctx.core.sim.account("sim-001").unwrap().balance < 100_000.0);

        let (status, body) =
            post_json(&app, "/api/paper-trading/accounts/sim-001/reset", serde_json::json!({}))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 100_000.0);

        let (status, _) =
            post_json(&app, "/api/paper-trading/accounts/ghost/reset", serde_json::json!({}))
                .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn strategy_mode_endpoint_promotes_explicitly() {
        let (app, ctx, _dir) = app();
        ctx.core.tracker.register("rsi_rev");

        let (status, transition) = post_json(
            &app,
            "/api/strategies/rsi_rev/mode",
            serde_json::json!({ "new_mode": "live" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(transition["to_mode"], "live");
        assert_eq!(
            ctx.core.tracker.current_mode("rsi_rev"),
            Some(StrategyMode::Live)
        );

        // Setting the same mode again conflicts.
        let (status, _) = post_json(
            &app,
            "/api/strategies/rsi_rev/mode",
            serde_json::json!({ "new_mode": "live" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn strategy_summaries_shape() {
        let (app, ctx, _dir) = app();
        ctx.core.tracker.register("alpha");
        let (status, body) = get_json(&app, "/api/strategies/summaries").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["strategy_id"], "alpha");
        assert_eq!(body[0]["current_mode"], "paper");
        assert_eq!(body[0]["live_eligible"], false);
    }

    #[tokio::test]
    async fn funded_account_pause_resume() {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let mut config = EngineConfig::default();
        config.account_groups.push(crate::config::AccountGroupConfig {
            key: "topstep".into(),
            backend: "tradovate".into(),
            live_account_id: Some("TS50K001".into()),
            risk_profile: Some(crate::config::FundedRules {
                max_daily_loss: 1000.0,
                ..Default::default()
            }),
        });
        let core = CoreState::new(config, persist);
        let ctx = ApiContext::new(core);
        let app = router(ctx.clone());

        let (status, list) = get_json(&app, "/api/funded-accounts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list[0]["account_id"], "TS50K001");
        assert_eq!(list[0]["status"], "active");

        let (status, body) =
            post_json(&app, "/api/funded-accounts/TS50K001/pause", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paused");

        let (status, body) =
            post_json(&app, "/api/funded-accounts/TS50K001/resume", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
    }

    #[tokio::test]
    async fn cancel_resting_order() {
        let (app, ctx, _dir) = app();
        ctx.core.quotes.apply_trade("ES", 5000.0, Utc::now());

        let (status, order) = post_json(
            &app,
            "/api/orders",
            serde_json::json!({
                "symbol": "ES",
                "action": "buy",
                "quantity": 1,
                "order_type": "limit",
                "price": 4900.0,
                "account_group": "paper_simulator",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let order_id = order["order_id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/orders/{order_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            ctx.core.orders.get(&order_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
