// =============================================================================
// Paper Simulator — deterministic in-process matching engine
// =============================================================================
//
// Market orders match synchronously against the cached quote; limit, stop,
// and stop-limit orders join a per-symbol queue ordered by price priority and
// then insertion counter (FIFO), evaluated on every quote tick. Orders that
// arrive while the session is closed queue until the next session's first
// tick regardless of type.
//
// All matching is non-suspending compute behind one write lock; the async
// trait surface only wraps it. Fills are delivered through per-account
// broadcast channels that `subscribe_fills` taps, replaying missed fills
// after `last_seen_fill_id` on reconnect.
//
// Cash conservation is checked after every fill; a breach marks the backend
// degraded: it refuses new traffic but does not terminate the process.
// =============================================================================

pub mod account;
pub mod costs;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{
    AccountSnapshot, AdapterHealth, BrokerAdapter, BrokerError, CancelOutcome, PositionSnapshot,
    SubmitAck,
};
use crate::clock;
use crate::config::PaperAccountConfig;
use crate::orders::{Fill, Order};
use crate::quotes::QuoteCache;
use crate::types::{OrderSide, OrderStatus, OrderType, TradingSession};

use account::PaperAccount;
use costs::CostModel;

/// Backend tag the router resolves for paper groups.
pub const SIMULATOR_BACKEND: &str = "simulator";

/// Per-account fill channel capacity.
const FILL_CHANNEL_CAPACITY: usize = 512;

// =============================================================================
// Pending order queue
// =============================================================================

#[derive(Debug, Clone)]
struct PendingOrder {
    order: Order,
    /// Lower key = matched earlier. Derived from price aggressiveness.
    priority: f64,
    /// FIFO tie-break within equal priority.
    seq: u64,
}

/// Price priority: more aggressive orders match first.
fn price_priority(order: &Order) -> f64 {
    match (order.order_type, order.side) {
        // Highest buy limit is most aggressive.
        (OrderType::Limit, OrderSide::Buy) => -order.limit_price.unwrap_or(f64::MIN),
        (OrderType::Limit, OrderSide::Sell) => order.limit_price.unwrap_or(f64::MAX),
        // Lowest buy stop triggers soonest on the way up.
        (OrderType::Stop | OrderType::StopLimit, OrderSide::Buy) => {
            order.stop_price.unwrap_or(f64::MAX)
        }
        (OrderType::Stop | OrderType::StopLimit, OrderSide::Sell) => {
            -order.stop_price.unwrap_or(f64::MIN)
        }
        // Queued market orders match ahead of everything.
        (OrderType::Market, _) => f64::MIN,
    }
}

/// Trigger test against the current tick price.
fn is_triggered(order: &Order, price: f64) -> bool {
    match (order.order_type, order.side) {
        (OrderType::Market, _) => true,
        (OrderType::Limit, OrderSide::Buy) => price <= order.limit_price.unwrap_or(f64::MIN),
        (OrderType::Limit, OrderSide::Sell) => price >= order.limit_price.unwrap_or(f64::MAX),
        (OrderType::Stop, OrderSide::Buy) => price >= order.stop_price.unwrap_or(f64::MAX),
        (OrderType::Stop, OrderSide::Sell) => price <= order.stop_price.unwrap_or(f64::MIN),
        (OrderType::StopLimit, OrderSide::Buy) => {
            price >= order.stop_price.unwrap_or(f64::MAX)
                && price <= order.limit_price.unwrap_or(f64::MIN)
        }
        (OrderType::StopLimit, OrderSide::Sell) => {
            price <= order.stop_price.unwrap_or(f64::MIN)
                && price >= order.limit_price.unwrap_or(f64::MAX)
        }
    }
}

// =============================================================================
// Engine state
// =============================================================================

struct Engine {
    accounts: HashMap<String, PaperAccount>,
    /// Per-symbol pending queues, kept sorted by (priority, seq).
    pending: HashMap<String, Vec<PendingOrder>>,
    insertion_counter: u64,
    /// Complete fill log, in production order, for stream resumption.
    fill_log: Vec<Fill>,
}

impl Engine {
    /// Park an order in its symbol queue. Orders submitted while the session
    /// is closed land here too; ticks during closed sessions are ignored, so
    /// they wake on the next session's first tick.
    fn enqueue(&mut self, order: Order) {
        self.insertion_counter += 1;
        let pending = PendingOrder {
            priority: price_priority(&order),
            seq: self.insertion_counter,
            order,
        };
        let queue = pending_queue(&mut self.pending, &pending.order.symbol);
        let at = queue
            .binary_search_by(|p| {
                (p.priority, p.seq)
                    .partial_cmp(&(pending.priority, pending.seq))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or_else(|i| i);
        queue.insert(at, pending);
    }
}

fn pending_queue<'a>(
    pending: &'a mut HashMap<String, Vec<PendingOrder>>,
    symbol: &str,
) -> &'a mut Vec<PendingOrder> {
    pending.entry(symbol.to_string()).or_default()
}

// =============================================================================
// Simulator
// =============================================================================

/// The in-process paper execution backend.
pub struct PaperSimulator {
    engine: RwLock<Engine>,
    quotes: Arc<QuoteCache>,
    costs: CostModel,
    /// Per-account live fill fan-out.
    fill_channels: RwLock<HashMap<String, broadcast::Sender<Fill>>>,
    /// Reason the simulator went degraded, if it has.
    degraded: RwLock<Option<String>>,
    last_ok: RwLock<Option<DateTime<Utc>>>,
}

impl PaperSimulator {
    pub fn new(
        accounts: &[PaperAccountConfig],
        quotes: Arc<QuoteCache>,
        costs: CostModel,
    ) -> Self {
        let now = Utc::now();
        let accounts = accounts
            .iter()
            .map(|cfg| (cfg.id.clone(), PaperAccount::from_config(cfg, now)))
            .collect();

        Self {
            engine: RwLock::new(Engine {
                accounts,
                pending: HashMap::new(),
                insertion_counter: 0,
                fill_log: Vec::new(),
            }),
            quotes,
            costs,
            fill_channels: RwLock::new(HashMap::new()),
            degraded: RwLock::new(None),
            last_ok: RwLock::new(None),
        }
    }

    /// Restore an account snapshot rebuilt from persistence.
    pub fn restore_account(&self, account: PaperAccount) {
        self.engine
            .write()
            .accounts
            .insert(account.id.clone(), account);
    }

    pub fn account(&self, account_id: &str) -> Option<PaperAccount> {
        self.engine.read().accounts.get(account_id).cloned()
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.engine.read().accounts.keys().cloned().collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.read().is_some()
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded.read().clone()
    }

    /// Atomically restore balances and clear positions, pending orders, and
    /// the account's portion of the fill log.
    pub fn reset(&self, account_id: &str) -> Result<PaperAccount, String> {
        let now = Utc::now();
        let mut engine = self.engine.write();
        let account = engine
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| format!("unknown paper account {account_id}"))?;
        account.reset(now);
        let snapshot = account.clone();

        for queue in engine.pending.values_mut() {
            queue.retain(|p| p.order.account_id != account_id);
        }
        engine.fill_log.retain(|f| f.account_id != account_id);
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Submission (testable with an explicit clock)
    // -------------------------------------------------------------------------

    /// Submit at an explicit time. The trait method delegates here with
    /// `Utc::now()`; tests drive sessions directly.
    pub fn submit_at(&self, order: &Order, now: DateTime<Utc>) -> Result<SubmitAck, BrokerError> {
        if let Some(reason) = self.degraded.read().clone() {
            return Err(BrokerError::Permanent(format!(
                "simulator degraded: {reason}"
            )));
        }

        let mut engine = self.engine.write();
        if !engine.accounts.contains_key(&order.account_id) {
            return Err(BrokerError::Permanent(format!(
                "unknown paper account {}",
                order.account_id
            )));
        }

        // Duplicate submission (retry): acknowledge the original.
        if engine
            .fill_log
            .iter()
            .any(|f| f.order_id == order.order_id)
            || engine
                .pending
                .values()
                .flatten()
                .any(|p| p.order.order_id == order.order_id)
        {
            return Ok(SubmitAck {
                order_id: order.order_id.clone(),
                status: OrderStatus::Working,
                reason: Some("duplicate submission".into()),
            });
        }

        let spec = self.costs.spec(&order.symbol);
        let session = clock::classify_session(spec.asset_class, now);

        if session == TradingSession::Closed {
            info!(
                order_id = %order.order_id,
                symbol = %order.symbol,
                "session closed — order queued until next session"
            );
            engine.enqueue(order.clone());
            *self.last_ok.write() = Some(now);
            return Ok(SubmitAck {
                order_id: order.order_id.clone(),
                status: OrderStatus::Working,
                reason: Some("queued: session closed".into()),
            });
        }

        match order.order_type {
            OrderType::Market => {
                let p_ref = self
                    .quotes
                    .latest(&order.symbol)
                    .map(|q| q.last)
                    .or(order.limit_price);

                match p_ref {
                    Some(p_ref) => {
                        let fills =
                            self.match_order(&mut engine, order, p_ref, session, now)?;
                        drop(engine);
                        self.dispatch_fills(fills);
                        *self.last_ok.write() = Some(now);
                        Ok(SubmitAck {
                            order_id: order.order_id.clone(),
                            status: OrderStatus::Working,
                            reason: None,
                        })
                    }
                    None => {
                        // No reference price yet: match on the first tick.
                        engine.enqueue(order.clone());
                        *self.last_ok.write() = Some(now);
                        Ok(SubmitAck {
                            order_id: order.order_id.clone(),
                            status: OrderStatus::Working,
                            reason: Some("queued: awaiting first quote".into()),
                        })
                    }
                }
            }
            OrderType::Limit | OrderType::Stop | OrderType::StopLimit => {
                engine.enqueue(order.clone());
                *self.last_ok.write() = Some(now);
                Ok(SubmitAck {
                    order_id: order.order_id.clone(),
                    status: OrderStatus::Working,
                    reason: None,
                })
            }
        }
    }

    /// Evaluate pending orders for `symbol` against a fresh tick.
    pub fn on_quote(&self, symbol: &str, price: f64, now: DateTime<Utc>) -> Vec<Fill> {
        if self.degraded.read().is_some() {
            return Vec::new();
        }

        let spec = self.costs.spec(symbol);
        let session = clock::classify_session(spec.asset_class, now);
        if session == TradingSession::Closed {
            return Vec::new();
        }

        let mut engine = self.engine.write();
        let Some(queue) = engine.pending.get(symbol) else {
            return Vec::new();
        };

        // Collect triggered orders in queue (price, FIFO) order.
        let triggered: Vec<Order> = queue
            .iter()
            .filter(|p| is_triggered(&p.order, price))
            .map(|p| p.order.clone())
            .collect();
        if triggered.is_empty() {
            return Vec::new();
        }

        let triggered_ids: Vec<String> =
            triggered.iter().map(|o| o.order_id.clone()).collect();
        if let Some(queue) = engine.pending.get_mut(symbol) {
            queue.retain(|p| !triggered_ids.contains(&p.order.order_id));
        }

        let mut fills = Vec::new();
        for order in &triggered {
            // Limit orders fill at their limit price when marketable;
            // stops and queued markets fill at the tick.
            let p_ref = match order.order_type {
                OrderType::Limit | OrderType::StopLimit => {
                    order.limit_price.unwrap_or(price)
                }
                _ => price,
            };
            match self.match_order(&mut engine, order, p_ref, session, now) {
                Ok(mut f) => fills.append(&mut f),
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "pending order match failed");
                }
            }
        }
        drop(engine);

        self.dispatch_fills(fills.clone());
        *self.last_ok.write() = Some(now);
        fills
    }

    // -------------------------------------------------------------------------
    // Matching internals
    // -------------------------------------------------------------------------

    fn match_order(
        &self,
        engine: &mut Engine,
        order: &Order,
        p_ref: f64,
        session: TradingSession,
        now: DateTime<Utc>,
    ) -> Result<Vec<Fill>, BrokerError> {
        let spec = self.costs.spec(&order.symbol);
        let volatility = self.quotes.volatility_mult(&order.symbol, now);
        let qty = order.remaining_qty();
        if qty <= 0.0 {
            return Ok(Vec::new());
        }

        let (fill_price, slippage) =
            self.costs
                .fill_price(&spec, session, volatility, order.side, qty, p_ref);
        let commission = self.costs.commission(&spec, qty);
        let fees = self.costs.fees(&spec, qty);

        let account = engine
            .accounts
            .get_mut(&order.account_id)
            .ok_or_else(|| {
                BrokerError::Permanent(format!("unknown paper account {}", order.account_id))
            })?;

        let mut marks = HashMap::new();
        marks.insert(order.symbol.clone(), p_ref);
        account.maybe_roll_day(now, &marks);

        let mut fill = Fill::new(order, qty, fill_price);
        fill.commission = commission;
        fill.fees = fees;
        fill.slippage = slippage;
        fill.ts = now;

        let applied = account.apply_fill(&fill, spec.multiplier);
        fill.realized_pnl = applied.realized_delta;
        fill.position_after = Some(applied.net_qty_after);

        if let Err(breach) = account.check_conservation() {
            error!(account = %order.account_id, breach = %breach, "simulator inconsistency — degrading backend");
            *self.degraded.write() = Some(breach.clone());
            return Err(BrokerError::Permanent(breach));
        }

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty,
            fill_price,
            slippage,
            commission,
            session = %session,
            "paper fill produced"
        );

        engine.fill_log.push(fill.clone());
        Ok(vec![fill])
    }

    fn dispatch_fills(&self, fills: Vec<Fill>) {
        if fills.is_empty() {
            return;
        }
        let channels = self.fill_channels.read();
        for fill in fills {
            if let Some(tx) = channels.get(&fill.account_id) {
                // Send errors only mean no subscriber is attached right now;
                // the fill log covers resumption.
                let _ = tx.send(fill);
            }
        }
    }

    fn fill_channel(&self, account_id: &str) -> broadcast::Sender<Fill> {
        if let Some(tx) = self.fill_channels.read().get(account_id) {
            return tx.clone();
        }
        let mut channels = self.fill_channels.write();
        channels
            .entry(account_id.to_string())
            .or_insert_with(|| broadcast::channel(FILL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

// =============================================================================
// BrokerAdapter implementation
// =============================================================================

#[async_trait]
impl BrokerAdapter for PaperSimulator {
    fn name(&self) -> &str {
        SIMULATOR_BACKEND
    }

    async fn submit(&self, order: &Order) -> Result<SubmitAck, BrokerError> {
        self.submit_at(order, Utc::now())
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError> {
        let mut engine = self.engine.write();

        let mut found = false;
        for queue in engine.pending.values_mut() {
            let before = queue.len();
            queue.retain(|p| p.order.order_id != order_id);
            if queue.len() != before {
                found = true;
            }
        }
        if found {
            info!(order_id, "pending paper order cancelled");
            return Ok(CancelOutcome::Ok);
        }

        if engine.fill_log.iter().any(|f| f.order_id == order_id) {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        Ok(CancelOutcome::NotFound)
    }

    async fn flatten(&self, account_id: &str) -> Result<usize, BrokerError> {
        let now = Utc::now();
        let open: Vec<(String, f64)> = {
            let engine = self.engine.read();
            let account = engine.accounts.get(account_id).ok_or_else(|| {
                BrokerError::Permanent(format!("unknown paper account {account_id}"))
            })?;
            account
                .positions
                .values()
                .filter(|p| p.net_qty != 0.0)
                .map(|p| (p.symbol.clone(), p.net_qty))
                .collect()
        };

        let mut closed = 0usize;
        for (symbol, net_qty) in open {
            let Some(quote) = self.quotes.latest(&symbol) else {
                warn!(account_id, symbol = %symbol, "flatten skipped symbol without a quote");
                continue;
            };

            let side = if net_qty > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            let order = crate::orders::new_order(
                &format!("flatten-{}", Uuid::new_v4()),
                account_id,
                "",
                SIMULATOR_BACKEND,
                &symbol,
                side,
                net_qty.abs(),
                OrderType::Market,
                None,
                None,
                None,
            );

            let spec = self.costs.spec(&symbol);
            let session = clock::classify_session(spec.asset_class, now);
            let mut engine = self.engine.write();
            let fills = self.match_order(&mut engine, &order, quote.last, session, now)?;
            drop(engine);
            self.dispatch_fills(fills);
            closed += 1;
        }

        info!(account_id, closed, "paper account flattened");
        Ok(closed)
    }

    async fn subscribe_fills(
        &self,
        account_id: &str,
        last_seen_fill_id: Option<String>,
    ) -> Result<mpsc::Receiver<Fill>, BrokerError> {
        let (tx, rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);

        // Replay anything after the resumption point, then follow live.
        let missed: Vec<Fill> = {
            let engine = self.engine.read();
            let start = match &last_seen_fill_id {
                Some(id) => engine
                    .fill_log
                    .iter()
                    .position(|f| &f.fill_id == id)
                    .map(|i| i + 1)
                    .unwrap_or(0),
                None => engine.fill_log.len(),
            };
            engine.fill_log[start..]
                .iter()
                .filter(|f| f.account_id == account_id)
                .cloned()
                .collect()
        };

        let mut live = self.fill_channel(account_id).subscribe();
        tokio::spawn(async move {
            for fill in missed {
                if tx.send(fill).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(fill) => {
                        if tx.send(fill).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fill subscriber lagged — continuing from oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot, BrokerError> {
        let engine = self.engine.read();
        let account = engine
            .accounts
            .get(account_id)
            .ok_or_else(|| BrokerError::Permanent(format!("unknown paper account {account_id}")))?;

        let mut marks = HashMap::new();
        for symbol in account.positions.keys() {
            if let Some(q) = self.quotes.latest(symbol) {
                marks.insert(symbol.clone(), q.last);
            }
        }

        let positions = account
            .positions
            .values()
            .filter(|p| p.net_qty != 0.0)
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                net_qty: p.net_qty,
                avg_entry: p.avg_entry,
                unrealized_pnl: marks
                    .get(&p.symbol)
                    .map(|m| p.unrealized(*m))
                    .unwrap_or(0.0),
                realized_pnl: p.realized_pnl,
            })
            .collect();

        Ok(AccountSnapshot {
            account_id: account_id.to_string(),
            balance: account.balance,
            equity: account.equity(&marks),
            day_pnl: account.day_pnl(&marks),
            positions,
        })
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth {
            connected: true,
            last_ok: *self.last_ok.read(),
            last_error: self.degraded.read().clone(),
            degraded: self.degraded.read().is_some(),
        }
    }
}

impl std::fmt::Debug for PaperSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = self.engine.read();
        f.debug_struct("PaperSimulator")
            .field("accounts", &engine.accounts.len())
            .field("pending", &engine.pending.values().map(|q| q.len()).sum::<usize>())
            .field("fills", &engine.fill_log.len())
            .field("degraded", &self.degraded.read().is_some())
            .finish()
    }
}
