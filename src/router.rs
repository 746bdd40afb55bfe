// =============================================================================
// Router — account-group resolution, mode overlay, risk gate, dispatch
// =============================================================================
//
// One router task owns the bounded inbound queue, so for any single account
// the order in which alerts arrive is the order in which orders reach the
// backend. Decision rules, first match wins:
//
//   1. unknown account group            -> reject unknown_account_group
//   2. paper_ prefixed group            -> paper backend, effective mode paper
//   3. strategy in paper/suspended mode -> override route to the simulator,
//                                          annotate the order, emit an event
//   4. funded rules                     -> violation rejects, warning annotates
//   5. quantity clamp at max_contracts  -> clamp, reject if no exposure room
//
// Every external call runs under the alert's dispatch budget; a timeout is
// indeterminate and the next retry is idempotent via (account_id, alert_id).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alert::Alert;
use crate::broker::{BrokerAdapter, BrokerError};
use crate::events::{self, EventType};
use crate::funded::{Evaluation, ProposedOrder};
use crate::orders::{new_order, Order};
use crate::persist::Stream;
use crate::sim::SIMULATOR_BACKEND;
use crate::state::CoreState;
use crate::types::{OrderSide, OrderStatus, StrategyMode};

/// Machine-readable routing rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    UnknownAccountGroup,
    RiskViolation,
    ExposureExceeded,
    NoPositionToClose,
    NoPaperAccount,
    UnknownBackend,
    BrokerRejected,
    BrokerUnavailable,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Result of routing one alert.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// An order was created and dispatched (it may still reject at the
    /// backend; poll /api/orders/{id} for terminal state).
    Dispatched(Order),
    /// The alert was refused before or during dispatch.
    Rejected { code: RejectCode, message: String },
}

impl RouteOutcome {
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }
}

/// The single router task. Exits when ingress drops the channel.
pub async fn run_router(state: Arc<CoreState>, mut rx: mpsc::Receiver<Alert>) {
    info!("router task started");
    while let Some(alert) = rx.recv().await {
        let outcome = route_alert(&state, &alert).await;
        if let RouteOutcome::Rejected { code, message } = &outcome {
            warn!(
                alert_id = %alert.alert_id,
                code = %code,
                message = %message,
                "alert rejected by router"
            );
        }
    }
    info!("router task stopped — inbound channel closed");
}

/// Route one alert through the full decision pipeline.
pub async fn route_alert(state: &Arc<CoreState>, alert: &Alert) -> RouteOutcome {
    let now = Utc::now();

    // ── 1. Account group ────────────────────────────────────────────────
    let group = {
        let config = state.config.read();
        match config.group(&alert.account_group) {
            Some(g) => g.clone(),
            None => {
                let outcome = RouteOutcome::rejected(
                    RejectCode::UnknownAccountGroup,
                    format!("unknown account group {:?}", alert.account_group),
                );
                publish_rejection(state, alert, &outcome);
                return outcome;
            }
        }
    };

    // ── 2-3. Backend selection with strategy mode overlay ──────────────
    let mut backend = group.backend.clone();
    let mut account_id = group.account_id().to_string();
    let mut mode_override = false;

    if group.is_paper_prefix() {
        // Effective mode is paper by construction of the group key.
    } else if let Some(strategy_id) = &alert.strategy_id {
        state.tracker.register(strategy_id);
        let mode = state
            .tracker
            .current_mode(strategy_id)
            .unwrap_or(StrategyMode::Paper);
        if mode != StrategyMode::Live {
            // Route to paper instead of the live venue.
            match paper_target(state) {
                Some((paper_backend, paper_account)) => {
                    backend = paper_backend;
                    account_id = paper_account;
                    mode_override = true;
                    state.bus.publish(
                        EventType::StrategyModeChange,
                        &events::strategies_topic(strategy_id),
                        serde_json::json!({
                            "event": "mode_override",
                            "strategy_id": strategy_id,
                            "strategy_mode": mode,
                            "alert_id": alert.alert_id,
                            "routed_backend": SIMULATOR_BACKEND,
                        }),
                    );
                    info!(
                        strategy = %strategy_id,
                        mode = %mode,
                        alert_id = %alert.alert_id,
                        "live alert overridden to paper by strategy mode"
                    );
                }
                None => {
                    let outcome = RouteOutcome::rejected(
                        RejectCode::NoPaperAccount,
                        "strategy mode requires paper routing but no paper account is configured",
                    );
                    publish_rejection(state, alert, &outcome);
                    return outcome;
                }
            }
        }
    }

    let Some(adapter) = state.adapters.get(&backend) else {
        let outcome = RouteOutcome::rejected(
            RejectCode::UnknownBackend,
            format!("no adapter registered for backend {backend:?}"),
        );
        publish_rejection(state, alert, &outcome);
        return outcome;
    };

    // ── Idempotency: a retried alert reuses its original order ──────────
    if let Some(existing) = state.orders.order_for_alert(&account_id, &alert.alert_id) {
        info!(
            alert_id = %alert.alert_id,
            order_id = %existing.order_id,
            "alert already routed — returning existing order"
        );
        return RouteOutcome::Dispatched(existing);
    }

    // ── Side resolution (close/exit needs the open position) ────────────
    let budget = Duration::from_millis(state.config.read().ingress.dispatch_budget_ms);
    let (side, qty) = if alert.action.is_closing() {
        let snapshot = tokio::time::timeout(budget, adapter.account_snapshot(&account_id)).await;
        let position = match snapshot {
            Ok(Ok(snap)) => snap
                .positions
                .iter()
                .find(|p| p.symbol == alert.symbol)
                .map(|p| p.net_qty)
                .unwrap_or(0.0),
            Ok(Err(e)) => {
                warn!(error = %e, "account snapshot failed during close resolution");
                0.0
            }
            Err(_) => {
                warn!("account snapshot timed out during close resolution");
                0.0
            }
        };
        if position.abs() < 1e-9 {
            let outcome = RouteOutcome::rejected(
                RejectCode::NoPositionToClose,
                format!("no open {} position in {}", account_id, alert.symbol),
            );
            publish_rejection(state, alert, &outcome);
            return outcome;
        }
        let side = if position > 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        (side, alert.quantity.min(position.abs()))
    } else if alert.action.side_sign() > 0.0 {
        (OrderSide::Buy, alert.quantity)
    } else {
        (OrderSide::Sell, alert.quantity)
    };

    // ── 4. Funded-account rules ─────────────────────────────────────────
    let mut risk_warnings = Vec::new();
    let mut qty = qty;

    if let Some(rules) = &group.risk_profile {
        let spec = state.costs.spec(&alert.symbol);
        let worst_case_loss = state.costs.worst_case_slippage(&alert.symbol, qty)
            * qty
            * spec.multiplier
            + state.costs.commission(&spec, qty)
            + state.costs.fees(&spec, qty);

        let proposed = ProposedOrder {
            symbol: alert.symbol.clone(),
            qty,
            worst_case_loss,
        };

        match state.funded.evaluate_order(&account_id, rules, &proposed, now) {
            Evaluation::Ok => {}
            Evaluation::Warn(reasons) => {
                risk_warnings = reasons;
            }
            Evaluation::Violate { rule, reason, .. } => {
                // Persist and broadcast a freshly recorded violation; the
                // refusal on an already-locked account records nothing new.
                let fresh = rule != "account_violated" && rule != "account_paused";
                if fresh {
                    if let Some(v) = state.funded.violations(Some(&account_id)).last() {
                        state.persist.append(Stream::RiskViolations, v);
                        state.bus.publish(
                            EventType::Violation,
                            &events::accounts_topic(&account_id),
                            serde_json::to_value(v).unwrap_or_default(),
                        );
                    }
                }

                let mut order = build_order(alert, &account_id, &group.key, &backend, side, qty);
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(rule.clone());
                let order = state.orders.insert(order);
                state.persist.append(Stream::Orders, &order);
                state.dedupe.record_order(&alert.alert_id, &order.order_id);
                state.bus.publish(
                    EventType::Order,
                    &events::orders_topic(&account_id),
                    serde_json::to_value(&order).unwrap_or_default(),
                );

                return RouteOutcome::rejected(RejectCode::RiskViolation, reason);
            }
        }

        // ── 5. Size clamp ───────────────────────────────────────────────
        if rules.max_contracts > 0.0 && qty > rules.max_contracts {
            info!(
                alert_id = %alert.alert_id,
                requested = qty,
                clamped = rules.max_contracts,
                "quantity clamped to max_contracts"
            );
            qty = rules.max_contracts;
        }

        // Clamped size must still fit inside remaining exposure room.
        if rules.max_contracts > 0.0 && !alert.action.is_closing() {
            if let Some(account) = state.sim.account(&account_id) {
                let exposure: f64 =
                    account.positions.values().map(|p| p.net_qty.abs()).sum();
                let room = (rules.max_contracts - exposure).max(0.0);
                if qty > room {
                    let outcome = RouteOutcome::rejected(
                        RejectCode::ExposureExceeded,
                        format!(
                            "clamped quantity {qty} exceeds remaining exposure room {room}"
                        ),
                    );
                    publish_rejection(state, alert, &outcome);
                    return outcome;
                }
            }
        }
    }

    // ── Create, persist, dispatch ───────────────────────────────────────
    let mut order = build_order(alert, &account_id, &group.key, &backend, side, qty);
    order.mode_override = mode_override;
    order.risk_warnings = risk_warnings;
    let order = state.orders.insert(order);

    state.persist.append(Stream::Orders, &order);
    state.dedupe.record_order(&alert.alert_id, &order.order_id);
    state.bus.publish(
        EventType::Order,
        &events::orders_topic(&account_id),
        serde_json::to_value(&order).unwrap_or_default(),
    );

    let submit = tokio::time::timeout(budget, adapter.submit(&order)).await;
    match submit {
        Ok(Ok(ack)) => {
            let status = if ack.status == OrderStatus::Rejected {
                OrderStatus::Rejected
            } else {
                OrderStatus::Working
            };
            let updated = state
                .orders
                .set_status(&order.order_id, status, ack.reason.as_deref())
                .unwrap_or(order);
            state.persist.append(Stream::Orders, &updated);
            state.bus.publish(
                EventType::Order,
                &events::orders_topic(&account_id),
                serde_json::to_value(&updated).unwrap_or_default(),
            );
            if status == OrderStatus::Rejected {
                return RouteOutcome::rejected(
                    RejectCode::BrokerRejected,
                    updated.reject_reason.clone().unwrap_or_default(),
                );
            }
            RouteOutcome::Dispatched(updated)
        }
        Ok(Err(e)) => {
            let code = match &e {
                BrokerError::Transient(_) => RejectCode::BrokerUnavailable,
                BrokerError::Permanent(_) => RejectCode::BrokerRejected,
            };
            let updated = state
                .orders
                .set_status(&order.order_id, OrderStatus::Rejected, Some(e.message()))
                .unwrap_or(order);
            state.persist.append(Stream::Orders, &updated);
            state.bus.publish(
                EventType::Order,
                &events::orders_topic(&account_id),
                serde_json::to_value(&updated).unwrap_or_default(),
            );
            error!(order_id = %updated.order_id, error = %e, "dispatch failed");
            RouteOutcome::rejected(code, e.message().to_string())
        }
        Err(_) => {
            // Deadline exceeded: indeterminate. The order stays pending; a
            // retried alert re-dispatches under the same idempotency key.
            warn!(
                order_id = %order.order_id,
                budget_ms = budget.as_millis() as u64,
                "dispatch deadline exceeded — outcome indeterminate"
            );
            RouteOutcome::Dispatched(order)
        }
    }
}

/// Pick the paper account a mode-overridden alert lands in: prefer one whose
/// broker tag matches the original backend, else the first configured.
fn paper_target(state: &Arc<CoreState>) -> Option<(String, String)> {
    let config = state.config.read();
    config
        .paper_accounts
        .first()
        .map(|a| (SIMULATOR_BACKEND.to_string(), a.id.clone()))
}

fn build_order(
    alert: &Alert,
    account_id: &str,
    group_key: &str,
    backend: &str,
    side: OrderSide,
    qty: f64,
) -> Order {
    new_order(
        &alert.alert_id,
        account_id,
        group_key,
        backend,
        &alert.symbol,
        side,
        qty,
        alert.order_type,
        alert.price,
        alert.stop_price,
        alert.strategy_id.clone(),
    )
}

fn publish_rejection(state: &Arc<CoreState>, alert: &Alert, outcome: &RouteOutcome) {
    if let RouteOutcome::Rejected { code, message } = outcome {
        state.bus.publish(
            EventType::Error,
            events::ALERTS_TOPIC,
            serde_json::json!({
                "alert_id": alert.alert_id,
                "code": code,
                "message": message,
            }),
        );
    }
}
