// =============================================================================
// Order Store — arena for orders and fills
// =============================================================================
//
// Orders and fills are stored flat and referenced by string ids; nothing in
// the engine holds an owning pointer into the arena. The store enforces the
// two execution invariants:
//
//   - sum of fill quantities never exceeds the parent order quantity;
//   - no fill is ever applied to an order in a terminal state.
//
// Idempotency: `(account_id, alert_id)` maps to at most one order, so a
// retried dispatch reuses the original order instead of creating a second.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{OrderSide, OrderStatus, OrderType};

/// Quantity comparisons tolerate float accumulation error.
const QTY_EPSILON: f64 = 1e-9;

/// A request submitted to an execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub alert_id: String,
    pub account_id: String,
    pub account_group: String,
    pub backend: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub avg_fill_price: f64,
    /// True when the router re-routed a live alert to paper because of the
    /// strategy's current mode.
    #[serde(default)]
    pub mode_override: bool,
    /// Non-fatal rule-engine findings attached at routing time.
    #[serde(default)]
    pub risk_warnings: Vec<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }
}

/// A single atomic execution against one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    #[serde(default)]
    pub commission: f64,
    #[serde(default)]
    pub fees: f64,
    /// Signed price concession versus the reference price, in price units.
    #[serde(default)]
    pub slippage: f64,
    /// Realized P&L from quantity this fill closed (0 for opening fills).
    #[serde(default)]
    pub realized_pnl: f64,
    /// Net position in the symbol after this fill, when the backend knows it.
    #[serde(default)]
    pub position_after: Option<f64>,
    pub ts: DateTime<Utc>,
}

impl Fill {
    pub fn new(order: &Order, qty: f64, price: f64) -> Self {
        Self {
            fill_id: Uuid::new_v4().to_string(),
            order_id: order.order_id.clone(),
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty,
            price,
            commission: 0.0,
            fees: 0.0,
            slippage: 0.0,
            realized_pnl: 0.0,
            position_after: None,
            ts: Utc::now(),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Thread-safe arena owning all orders and fills for the process.
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
    /// Insertion order preserved for replay and recent-order queries.
    order_ids: RwLock<Vec<String>>,
    fills: RwLock<Vec<Fill>>,
    /// (account_id, alert_id) -> order_id.
    idempotency: RwLock<HashMap<(String, String), String>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            order_ids: RwLock::new(Vec::new()),
            fills: RwLock::new(Vec::new()),
            idempotency: RwLock::new(HashMap::new()),
        }
    }

    /// Order already created for this `(account_id, alert_id)` pair, if any.
    pub fn order_for_alert(&self, account_id: &str, alert_id: &str) -> Option<Order> {
        let key = (account_id.to_string(), alert_id.to_string());
        let id = self.idempotency.read().get(&key).cloned()?;
        self.get(&id)
    }

    /// Insert a new order. If the idempotency key is already mapped, the
    /// existing order is returned unchanged and the new one is discarded.
    pub fn insert(&self, order: Order) -> Order {
        let key = (order.account_id.clone(), order.alert_id.clone());
        {
            let idempotency = self.idempotency.read();
            if let Some(existing_id) = idempotency.get(&key) {
                if let Some(existing) = self.orders.read().get(existing_id) {
                    info!(
                        order_id = %existing.order_id,
                        alert_id = %order.alert_id,
                        "duplicate dispatch suppressed by idempotency key"
                    );
                    return existing.clone();
                }
            }
        }

        self.idempotency
            .write()
            .insert(key, order.order_id.clone());
        self.order_ids.write().push(order.order_id.clone());
        self.orders
            .write()
            .insert(order.order_id.clone(), order.clone());
        order
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    /// Startup replay: upsert an order record as persisted. Later records for
    /// the same order win (the stream is write-ahead ordered).
    pub fn restore(&self, order: Order) {
        let key = (order.account_id.clone(), order.alert_id.clone());
        self.idempotency
            .write()
            .insert(key, order.order_id.clone());
        let mut orders = self.orders.write();
        if !orders.contains_key(&order.order_id) {
            self.order_ids.write().push(order.order_id.clone());
        }
        orders.insert(order.order_id.clone(), order);
    }

    /// Startup replay: append a fill without re-running order invariants
    /// (the replayed order records already carry their filled quantities).
    pub fn restore_fill(&self, fill: Fill) {
        self.fills.write().push(fill);
    }

    /// Apply a fill to its parent order. Rejects fills on terminal orders and
    /// fills exceeding the remaining quantity.
    pub fn apply_fill(&self, fill: &Fill) -> Result<Order, String> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&fill.order_id)
            .ok_or_else(|| format!("fill references unknown order {}", fill.order_id))?;

        if order.status.is_terminal() {
            return Err(format!(
                "fill on terminal order {} (status {})",
                order.order_id, order.status
            ));
        }
        if fill.qty <= 0.0 {
            return Err(format!("non-positive fill qty {}", fill.qty));
        }
        if fill.qty > order.remaining_qty() + QTY_EPSILON {
            return Err(format!(
                "fill qty {} exceeds remaining {} on order {}",
                fill.qty,
                order.remaining_qty(),
                order.order_id
            ));
        }

        let filled_notional = order.avg_fill_price * order.filled_qty + fill.price * fill.qty;
        order.filled_qty += fill.qty;
        order.avg_fill_price = filled_notional / order.filled_qty;
        order.status = if order.remaining_qty() <= QTY_EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        order.updated_at = fill.ts;

        let snapshot = order.clone();
        drop(orders);

        self.fills.write().push(fill.clone());
        Ok(snapshot)
    }

    /// Move an order to a new status. Terminal orders never change again.
    pub fn set_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: Option<&str>,
    ) -> Option<Order> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(order_id)?;

        if order.status.is_terminal() {
            warn!(
                order_id,
                current = %order.status,
                requested = %status,
                "status change on terminal order ignored"
            );
            return Some(order.clone());
        }

        order.status = status;
        order.updated_at = Utc::now();
        if let Some(r) = reason {
            order.reject_reason = Some(r.to_string());
        }
        Some(order.clone())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Most recent `count` orders, newest first.
    pub fn recent(&self, count: usize) -> Vec<Order> {
        let ids = self.order_ids.read();
        let orders = self.orders.read();
        ids.iter()
            .rev()
            .take(count)
            .filter_map(|id| orders.get(id).cloned())
            .collect()
    }

    /// Non-terminal orders, optionally scoped to one account.
    pub fn open(&self, account_id: Option<&str>) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| account_id.map_or(true, |a| o.account_id == a))
            .cloned()
            .collect()
    }

    pub fn fills_for_order(&self, order_id: &str) -> Vec<Fill> {
        self.fills
            .read()
            .iter()
            .filter(|f| f.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn fill_count(&self) -> usize {
        self.fills.read().len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.orders.read().len())
            .field("fills", &self.fills.read().len())
            .finish()
    }
}

// =============================================================================
// Construction helper
// =============================================================================

/// Build a fresh order in `Pending` status.
#[allow(clippy::too_many_arguments)]
pub fn new_order(
    alert_id: &str,
    account_id: &str,
    account_group: &str,
    backend: &str,
    symbol: &str,
    side: OrderSide,
    qty: f64,
    order_type: OrderType,
    limit_price: Option<f64>,
    stop_price: Option<f64>,
    strategy_id: Option<String>,
) -> Order {
    let now = Utc::now();
    Order {
        order_id: Uuid::new_v4().to_string(),
        alert_id: alert_id.to_string(),
        account_id: account_id.to_string(),
        account_group: account_group.to_string(),
        backend: backend.to_string(),
        symbol: symbol.to_string(),
        side,
        qty,
        order_type,
        limit_price,
        stop_price,
        status: OrderStatus::Pending,
        filled_qty: 0.0,
        avg_fill_price: 0.0,
        mode_override: false,
        risk_warnings: Vec::new(),
        strategy_id,
        reject_reason: None,
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(qty: f64) -> Order {
        new_order(
            "alert-1",
            "sim-001",
            "paper_simulator",
            "simulator",
            "ES",
            OrderSide::Buy,
            qty,
            OrderType::Market,
            None,
            None,
            Some("new_ma".into()),
        )
    }

    #[test]
    fn fills_accumulate_and_terminate() {
        let store = OrderStore::new();
        let o = store.insert(order(3.0));

        let f1 = Fill::new(&o, 1.0, 5000.0);
        let after = store.apply_fill(&f1).unwrap();
        assert_eq!(after.status, OrderStatus::Partial);
        assert_eq!(after.filled_qty, 1.0);
        assert_eq!(after.avg_fill_price, 5000.0);

        let f2 = Fill::new(&o, 2.0, 5003.0);
        let after = store.apply_fill(&f2).unwrap();
        assert_eq!(after.status, OrderStatus::Filled);
        assert_eq!(after.filled_qty, 3.0);
        assert!((after.avg_fill_price - 5002.0).abs() < 1e-9);
        assert_eq!(store.fills_for_order(&o.order_id).len(), 2);
    }

    #[test]
    fn overfill_is_rejected() {
        let store = OrderStore::new();
        let o = store.insert(order(1.0));
        let f = Fill::new(&o, 2.0, 5000.0);
        assert!(store.apply_fill(&f).is_err());
        assert_eq!(store.get(&o.order_id).unwrap().filled_qty, 0.0);
    }

    #[test]
    fn no_fill_after_terminal() {
        let store = OrderStore::new();
        let o = store.insert(order(2.0));
        store.set_status(&o.order_id, OrderStatus::Cancelled, None);

        let f = Fill::new(&o, 1.0, 5000.0);
        assert!(store.apply_fill(&f).is_err());

        // Terminal status is sticky.
        let after = store
            .set_status(&o.order_id, OrderStatus::Working, None)
            .unwrap();
        assert_eq!(after.status, OrderStatus::Cancelled);
    }

    #[test]
    fn idempotency_key_suppresses_duplicates() {
        let store = OrderStore::new();
        let first = store.insert(order(1.0));
        let second = store.insert(order(1.0));
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(store.order_count(), 1);
        assert_eq!(
            store
                .order_for_alert("sim-001", "alert-1")
                .unwrap()
                .order_id,
            first.order_id
        );
        assert!(store.order_for_alert("sim-001", "alert-2").is_none());
    }

    #[test]
    fn open_orders_scoped_by_account() {
        let store = OrderStore::new();
        let o = store.insert(order(1.0));
        assert_eq!(store.open(Some("sim-001")).len(), 1);
        assert_eq!(store.open(Some("other")).len(), 0);

        store.set_status(&o.order_id, OrderStatus::Rejected, Some("risk"));
        assert!(store.open(None).is_empty());
        assert_eq!(
            store.get(&o.order_id).unwrap().reject_reason.as_deref(),
            Some("risk")
        );
    }

    #[test]
    fn recent_returns_newest_first() {
        let store = OrderStore::new();
        for i in 0..5 {
            let mut o = order(1.0);
            o.alert_id = format!("alert-{i}");
            store.insert(o);
        }
        let recent = store.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].alert_id, "alert-4");
        assert_eq!(recent[2].alert_id, "alert-2");
    }
}
