// =============================================================================
// Core State — the engine's subsystems wired together
// =============================================================================
//
// The single source of truth shared across async tasks via `Arc<CoreState>`.
// It owns the fill-application path: every fill, paper or live, flows through
// `handle_fill`, which updates the order arena, funded-account tracking, the
// round-trip accumulator feeding the strategy tracker, persistence, and the
// event bus — in that order.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, DedupeCache};
use crate::broker::http::HttpBrokerAdapter;
use crate::broker::{AdapterRegistry, BrokerAdapter, HttpFeedEndpoints};
use crate::config::EngineConfig;
use crate::credentials::CredentialStore;
use crate::events::{self, EventBus, EventType};
use crate::funded::FundedAccountManager;
use crate::orders::{Fill, Order, OrderStore};
use crate::persist::{PersistentStore, Stream};
use crate::quotes::QuoteCache;
use crate::sim::costs::CostModel;
use crate::sim::{PaperSimulator, SIMULATOR_BACKEND};
use crate::tracker::{StrategyTracker, TradeResult};
use crate::types::StrategyMode;

/// An open round trip per (account, symbol), accumulated from fills.
#[derive(Debug, Clone)]
struct RoundTrip {
    strategy_id: Option<String>,
    entry_fill_id: String,
    mode_at_entry: StrategyMode,
    realized: f64,
    costs: f64,
}

/// Central engine state shared by the API, router, and pump tasks.
pub struct CoreState {
    pub config: RwLock<EngineConfig>,
    pub credentials: Arc<CredentialStore>,
    pub quotes: Arc<QuoteCache>,
    pub costs: CostModel,
    pub sim: Arc<PaperSimulator>,
    pub adapters: AdapterRegistry,
    pub orders: OrderStore,
    pub tracker: StrategyTracker,
    pub funded: FundedAccountManager,
    pub bus: EventBus,
    pub persist: PersistentStore,
    pub dedupe: DedupeCache,

    /// Sender half of the bounded router inbound channel.
    router_tx: mpsc::Sender<Alert>,
    /// Receiver half, taken exactly once by the router task.
    router_rx: Mutex<Option<mpsc::Receiver<Alert>>>,

    /// Open round trips keyed by (account_id, symbol).
    round_trips: RwLock<HashMap<(String, String), RoundTrip>>,

    pub start_time: std::time::Instant,
}

impl CoreState {
    /// Assemble the engine from configuration. Adapters are registered for
    /// the simulator plus every backend named by an account group.
    pub fn new(config: EngineConfig, persist: PersistentStore) -> Arc<Self> {
        let credentials = Arc::new(CredentialStore::from_env());
        let quotes = Arc::new(QuoteCache::new());
        let costs = CostModel::new(config.default_asset_class);

        let sim = Arc::new(PaperSimulator::new(
            &config.paper_accounts,
            quotes.clone(),
            costs.clone(),
        ));

        let mut adapters = AdapterRegistry::new();
        adapters.register(sim.clone() as Arc<dyn BrokerAdapter>);
        for group in &config.account_groups {
            if group.backend == SIMULATOR_BACKEND || adapters.get(&group.backend).is_some() {
                continue;
            }
            match HttpFeedEndpoints::for_feed(&group.backend) {
                Some(endpoints) => {
                    adapters.register(Arc::new(HttpBrokerAdapter::from_credentials(
                        &group.backend,
                        endpoints.base_url,
                        endpoints.stream_url,
                        &credentials,
                    )));
                }
                None => {
                    warn!(
                        backend = %group.backend,
                        group = %group.key,
                        "account group names an unknown backend — routes will reject"
                    );
                }
            }
        }

        let (router_tx, router_rx) = mpsc::channel(config.ingress.router_queue_capacity);
        let bus = EventBus::new(config.bus_buffer);
        let tracker = StrategyTracker::new(config.strategy_defaults.clone());
        let dedupe = DedupeCache::new(config.ingress.dedupe_window_hours);

        Arc::new(Self {
            config: RwLock::new(config),
            credentials,
            quotes,
            costs,
            sim,
            adapters,
            orders: OrderStore::new(),
            tracker,
            funded: FundedAccountManager::new(),
            bus,
            persist,
            dedupe,
            router_tx,
            router_rx: Mutex::new(Some(router_rx)),
            round_trips: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    /// Try to hand an alert to the router. `false` means the bounded queue is
    /// full and ingress must answer with back-pressure.
    pub fn enqueue_alert(&self, alert: Alert) -> bool {
        match self.router_tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(a)) => {
                warn!(alert_id = %a.alert_id, "router queue full — alert refused");
                false
            }
            Err(mpsc::error::TrySendError::Closed(a)) => {
                error!(alert_id = %a.alert_id, "router queue closed — alert refused");
                false
            }
        }
    }

    /// Take the router receiver. Exactly one router task owns the queue.
    pub fn take_router_rx(&self) -> Option<mpsc::Receiver<Alert>> {
        self.router_rx.lock().take()
    }

    // -------------------------------------------------------------------------
    // Quote path
    // -------------------------------------------------------------------------

    /// Apply a trade print: update the cache, publish the quote, and drive
    /// the simulator's pending-order evaluation. Resulting fills reach
    /// `handle_fill` exactly once, through the account fill pumps.
    pub fn apply_trade_print(&self, symbol: &str, price: f64) {
        let now = Utc::now();
        self.quotes.apply_trade(symbol, price, now);
        self.bus.publish(
            EventType::Quote,
            &events::quotes_topic(symbol),
            serde_json::json!({ "symbol": symbol, "last": price, "ts": now }),
        );

        let _ = self.sim.on_quote(symbol, price, now);
    }

    // -------------------------------------------------------------------------
    // Fill path
    // -------------------------------------------------------------------------

    /// Apply one fill to every interested subsystem. Order matters: arena,
    /// persistence, funded tracking, round-trip/tracker, events.
    pub fn handle_fill(&self, fill: &Fill) {
        // 1. Order arena. Fills whose order is unknown (flatten synthetics,
        //    orders placed outside the engine) are retained without updating
        //    any order; fills violating arena invariants are dropped.
        let order = if self.orders.get(&fill.order_id).is_some() {
            match self.orders.apply_fill(fill) {
                Ok(order) => {
                    self.persist.append(Stream::Orders, &order);
                    self.bus.publish(
                        EventType::Order,
                        &events::orders_topic(&order.account_id),
                        serde_json::to_value(&order).unwrap_or_default(),
                    );
                    Some(order)
                }
                Err(reason) => {
                    error!(fill_id = %fill.fill_id, reason = %reason, "fill rejected by order arena");
                    return;
                }
            }
        } else {
            debug!(fill_id = %fill.fill_id, "fill without arena order retained");
            self.orders.restore_fill(fill.clone());
            None
        };

        // 2. Durable record.
        self.persist.append(Stream::Fills, fill);

        // 3. Funded-account tracking.
        let open_positions = self
            .sim
            .account(&fill.account_id)
            .map(|a| a.open_position_count() as u32)
            .unwrap_or(0);
        self.funded.record_fill(
            &fill.account_id,
            fill.realized_pnl,
            fill.commission + fill.fees,
            open_positions,
            fill.ts,
        );

        // 4. Round-trip accounting feeding the tracker.
        self.track_round_trip(fill, order.as_ref());

        // 5. Events.
        self.bus.publish(
            EventType::Fill,
            &events::fills_topic(&fill.account_id),
            serde_json::to_value(fill).unwrap_or_default(),
        );
        if let Some(account) = self.sim.account(&fill.account_id) {
            let position = account.positions.get(&fill.symbol);
            self.bus.publish(
                EventType::Position,
                &events::accounts_topic(&fill.account_id),
                serde_json::json!({
                    "account_id": fill.account_id,
                    "symbol": fill.symbol,
                    "net_qty": position.map(|p| p.net_qty).unwrap_or(0.0),
                    "avg_entry": position.map(|p| p.avg_entry).unwrap_or(0.0),
                    "realized_pnl": position.map(|p| p.realized_pnl).unwrap_or(0.0),
                }),
            );
        }
        self.publish_account_update(&fill.account_id);

        // 6. Paper account snapshot stays fresh for crash recovery.
        if let Some(account) = self.sim.account(&fill.account_id) {
            if let Err(e) = self
                .persist
                .write_snapshot(&format!("account-{}", account.id), &account)
            {
                warn!(error = %e, "paper account snapshot failed");
            }
        }
    }

    fn track_round_trip(&self, fill: &Fill, order: Option<&Order>) {
        let strategy_id = order.and_then(|o| o.strategy_id.clone());
        let key = (fill.account_id.clone(), fill.symbol.clone());
        let mut trips = self.round_trips.write();

        let trip = trips.entry(key.clone()).or_insert_with(|| RoundTrip {
            strategy_id: strategy_id.clone(),
            entry_fill_id: fill.fill_id.clone(),
            mode_at_entry: effective_mode(order),
            realized: 0.0,
            costs: 0.0,
        });
        if trip.strategy_id.is_none() {
            trip.strategy_id = strategy_id;
        }
        trip.realized += fill.realized_pnl;
        trip.costs += fill.commission + fill.fees;

        let flat = fill.position_after.map(|p| p.abs() < 1e-9).unwrap_or(false);
        if !flat {
            return;
        }

        let Some(trip) = trips.remove(&key) else {
            return;
        };
        drop(trips);

        let Some(strategy_id) = trip.strategy_id else {
            return;
        };

        let net_pnl = trip.realized - trip.costs;
        let trade = TradeResult {
            strategy_id: strategy_id.clone(),
            entry_fill_id: trip.entry_fill_id,
            exit_fill_id: fill.fill_id.clone(),
            pnl: trip.realized,
            net_pnl,
            win: net_pnl > 0.0,
            mode_at_entry: trip.mode_at_entry,
            ts: fill.ts,
        };

        info!(
            strategy = %strategy_id,
            net_pnl,
            win = trade.win,
            "round trip completed"
        );

        if let Some(t) = self.tracker.record_trade(trade) {
            self.persist.append(Stream::ModeTransitions, &t);
            self.bus.publish(
                EventType::StrategyModeChange,
                &events::strategies_topic(&strategy_id),
                serde_json::to_value(&t).unwrap_or_default(),
            );
        }

        if let Some(strategy) = self.tracker.get(&strategy_id) {
            if let Err(e) = self
                .persist
                .write_snapshot(&format!("strategy-{strategy_id}"), &strategy)
            {
                warn!(error = %e, "strategy snapshot failed");
            }
        }
    }

    /// Publish a fresh account snapshot event for streaming clients.
    pub fn publish_account_update(&self, account_id: &str) {
        if let Some(account) = self.sim.account(account_id) {
            let mut marks = HashMap::new();
            for symbol in account.positions.keys() {
                if let Some(q) = self.quotes.latest(symbol) {
                    marks.insert(symbol.clone(), q.last);
                }
            }
            self.bus.publish(
                EventType::Account,
                &events::accounts_topic(account_id),
                serde_json::json!({
                    "account_id": account.id,
                    "balance": account.balance,
                    "equity": account.equity(&marks),
                    "day_pnl": account.day_pnl(&marks),
                    "open_positions": account.open_position_count(),
                }),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Startup replay
    // -------------------------------------------------------------------------

    /// Rebuild in-memory state from snapshots and stream replay.
    pub fn replay(&self) -> anyhow::Result<()> {
        // Snapshots first: strategies and paper accounts.
        for name in self.persist.list_snapshots("strategy-") {
            if let Some(strategy) =
                self.persist.read_snapshot::<crate::tracker::Strategy>(&name)?
            {
                self.tracker.restore(strategy);
            }
        }
        for name in self.persist.list_snapshots("account-") {
            if let Some(account) = self
                .persist
                .read_snapshot::<crate::sim::account::PaperAccount>(&name)?
            {
                self.sim.restore_account(account);
            }
        }

        // Streams, oldest first.
        let mut alerts = 0usize;
        for record in self.persist.replay(Stream::Alerts)? {
            if let Ok(alert) = serde_json::from_value::<Alert>(record.data) {
                self.dedupe.insert(&alert.alert_id, alert.received_at);
                alerts += 1;
            }
        }

        let mut orders = 0usize;
        for record in self.persist.replay(Stream::Orders)? {
            if let Ok(order) = serde_json::from_value::<Order>(record.data) {
                self.dedupe.record_order(&order.alert_id, &order.order_id);
                self.orders.restore(order);
                orders += 1;
            }
        }

        for record in self.persist.replay(Stream::Fills)? {
            if let Ok(fill) = serde_json::from_value::<Fill>(record.data) {
                self.orders.restore_fill(fill);
            }
        }

        for record in self.persist.replay(Stream::ModeTransitions)? {
            if let Ok(t) = serde_json::from_value::<crate::tracker::ModeTransition>(record.data) {
                self.tracker.restore_transition(t);
            }
        }

        for record in self.persist.replay(Stream::RiskViolations)? {
            if let Ok(v) = serde_json::from_value::<crate::funded::RiskViolation>(record.data) {
                self.funded.restore_violation(v);
            }
        }

        info!(alerts, orders, "state replayed from persistence");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Best-effort shutdown: cancel outstanding orders on their adapters and
    /// flush snapshots.
    pub async fn shutdown(&self) {
        for order in self.orders.open(None) {
            if let Some(adapter) = self.adapters.get(&order.backend) {
                match adapter.cancel(&order.order_id).await {
                    Ok(outcome) => {
                        info!(
                            order_id = %order.order_id,
                            outcome = ?outcome,
                            "open order cancelled on shutdown"
                        );
                        self.orders.set_status(
                            &order.order_id,
                            crate::types::OrderStatus::Cancelled,
                            Some("engine shutdown"),
                        );
                    }
                    Err(e) => {
                        warn!(order_id = %order.order_id, error = %e, "shutdown cancel failed");
                    }
                }
            }
        }

        for account_id in self.sim.account_ids() {
            if let Some(account) = self.sim.account(&account_id) {
                let _ = self
                    .persist
                    .write_snapshot(&format!("account-{account_id}"), &account);
            }
        }
        for strategy in self.tracker.all_strategies() {
            let _ = self
                .persist
                .write_snapshot(&format!("strategy-{}", strategy.strategy_id), &strategy);
        }
        info!("core state flushed on shutdown");
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Connectivity summary for /api/status.
    pub fn status_snapshot(&self) -> serde_json::Value {
        let health = self.adapters.health_all();
        let feeds: serde_json::Map<String, serde_json::Value> = health
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "connected": h.connected,
                        "degraded": h.degraded,
                        "last_ok": h.last_ok,
                        "last_error": h.last_error,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "datahub": !self.persist.degraded_beyond_window(),
            "persistence_degraded": self.persist.is_degraded(),
            "feeds": feeds,
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "ts": Utc::now(),
        })
    }
}

/// Effective strategy mode for a round trip opened by `order`: anything the
/// router sent to the simulator ran in paper context.
fn effective_mode(order: Option<&Order>) -> StrategyMode {
    match order {
        Some(o) if o.backend == SIMULATOR_BACKEND || o.mode_override => StrategyMode::Paper,
        Some(_) => StrategyMode::Live,
        None => StrategyMode::Paper,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::orders::new_order;
    use crate::types::{OrderSide, OrderType};

    fn core() -> (Arc<CoreState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let state = CoreState::new(EngineConfig::default(), persist);
        (state, dir)
    }

    fn sim_order(state: &CoreState, side: OrderSide, strategy: Option<&str>) -> Order {
        let order = new_order(
            &uuid::Uuid::new_v4().to_string(),
            "sim-001",
            "paper_simulator",
            SIMULATOR_BACKEND,
            "ES",
            side,
            1.0,
            OrderType::Market,
            None,
            None,
            strategy.map(|s| s.to_string()),
        );
        state.orders.insert(order.clone());
        order
    }

    #[test]
    fn fill_path_updates_order_funded_and_events() {
        let (state, _dir) = core();
        let mut rx = state.bus.subscribe("fills/sim-001");

        let order = sim_order(&state, OrderSide::Buy, Some("new_ma"));
        let mut fill = Fill::new(&order, 1.0, 5000.0);
        fill.commission = 2.25;
        fill.fees = 1.4;
        fill.position_after = Some(1.0);

        state.handle_fill(&fill);

        let updated = state.orders.get(&order.order_id).unwrap();
        assert_eq!(updated.filled_qty, 1.0);

        let env = rx.try_recv().unwrap();
        assert_eq!(env.seq, 1);
        assert_eq!(env.data["order_id"], serde_json::json!(order.order_id));

        // Costs flow into funded-account daily P&L.
        let funded_state = state.funded.state("sim-001");
        assert!(funded_state.daily_pnl < 0.0);
    }

    #[test]
    fn round_trip_produces_trade_result() {
        let (state, _dir) = core();
        state.tracker.register("new_ma");

        let entry = sim_order(&state, OrderSide::Buy, Some("new_ma"));
        let mut entry_fill = Fill::new(&entry, 1.0, 5000.0);
        entry_fill.position_after = Some(1.0);
        state.handle_fill(&entry_fill);

        let exit = sim_order(&state, OrderSide::Sell, Some("new_ma"));
        let mut exit_fill = Fill::new(&exit, 1.0, 5010.0);
        exit_fill.realized_pnl = 500.0;
        exit_fill.position_after = Some(0.0);
        state.handle_fill(&exit_fill);

        let strategy = state.tracker.get("new_ma").unwrap();
        assert_eq!(strategy.lifetime.trades, 1);
        assert_eq!(strategy.current_set.trades.len(), 1);
        assert!(strategy.current_set.trades[0].win);
        assert_eq!(
            strategy.current_set.trades[0].mode_at_entry,
            StrategyMode::Paper
        );
    }

    #[test]
    fn enqueue_respects_bounded_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let mut config = EngineConfig::default();
        config.ingress.router_queue_capacity = 2;
        let state = CoreState::new(config, persist);

        let alert = |n: u32| {
            crate::alert::Alert::from_payload(
                &serde_json::json!({
                    "symbol": "ES",
                    "action": "buy",
                    "quantity": n,
                    "account_group": "paper_simulator"
                }),
                "10.0.0.1",
                Utc::now(),
            )
            .unwrap()
        };

        assert!(state.enqueue_alert(alert(1)));
        assert!(state.enqueue_alert(alert(2)));
        // Queue full; nothing is draining it.
        assert!(!state.enqueue_alert(alert(3)));
    }

    #[test]
    fn replay_restores_orders_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();

        let order_id;
        {
            let persist =
                PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
            let state = CoreState::new(EngineConfig::default(), persist);

            let alert = crate::alert::Alert::from_payload(
                &serde_json::json!({
                    "symbol": "ES",
                    "action": "buy",
                    "quantity": 1,
                    "account_group": "paper_simulator"
                }),
                "10.0.0.1",
                Utc::now(),
            )
            .unwrap();
            state.persist.append(Stream::Alerts, &alert);
            state.dedupe.insert(&alert.alert_id, alert.received_at);

            let mut order = sim_order(&state, OrderSide::Buy, None);
            order.alert_id = alert.alert_id.clone();
            state.persist.append(Stream::Orders, &order);
            order_id = order.order_id.clone();
        }

        let persist =
            PersistentStore::open(dir.path(), PersistenceConfig::default()).unwrap();
        let state = CoreState::new(EngineConfig::default(), persist);
        state.replay().unwrap();

        assert!(state.orders.get(&order_id).is_some());
        // The replayed alert suppresses a duplicate webhook.
        let replayed = state.persist.replay(Stream::Alerts).unwrap();
        let alert_id = replayed[0].data["alert_id"].as_str().unwrap();
        assert!(state.dedupe.get(alert_id, Utc::now()).is_some());
    }

    #[test]
    fn status_snapshot_lists_registered_feeds() {
        let (state, _dir) = core();
        let status = state.status_snapshot();
        assert_eq!(status["datahub"], serde_json::json!(true));
        assert!(status["feeds"]["simulator"]["connected"].as_bool().unwrap());
    }

    #[test]
    fn router_rx_taken_once() {
        let (state, _dir) = core();
        assert!(state.take_router_rx().is_some());
        assert!(state.take_router_rx().is_none());
    }
}
