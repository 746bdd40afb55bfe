// =============================================================================
// Paper Account — balances, positions, P&L under margin-style accounting
// =============================================================================
//
// Cash model: the balance moves only on realized P&L and costs
// (balance = initial + realized - commissions - fees); open positions carry
// unrealized P&L against their average entry. Equity = balance + unrealized.
//
// Conservation invariant, checked after every fill:
//   balance == initial_balance + total_realized - total_commissions
//            - total_fees    (within epsilon)
// A breach is a simulator inconsistency and degrades the backend.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock;
use crate::config::{PaperAccountConfig, PaperMode};
use crate::orders::Fill;

const CASH_EPSILON: f64 = 1e-6;

/// Net position in one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short.
    pub net_qty: f64,
    pub avg_entry: f64,
    /// Currency value of one point per unit.
    pub multiplier: f64,
    /// Realized P&L accumulated in this symbol.
    pub realized_pnl: f64,
}

impl PaperPosition {
    pub fn unrealized(&self, mark: f64) -> f64 {
        (mark - self.avg_entry) * self.net_qty * self.multiplier
    }
}

/// Outcome of applying one fill to the account.
#[derive(Debug, Clone)]
pub struct AppliedFill {
    /// Realized P&L delta from any closed quantity (before costs).
    pub realized_delta: f64,
    /// Quantity that closed existing exposure.
    pub closed_qty: f64,
    /// Net position in the symbol after the fill.
    pub net_qty_after: f64,
}

/// An in-process simulated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAccount {
    pub id: String,
    pub broker_tag: String,
    pub mode: PaperMode,
    pub initial_balance: f64,
    pub balance: f64,
    pub positions: HashMap<String, PaperPosition>,

    pub total_realized: f64,
    pub total_commissions: f64,
    pub total_fees: f64,
    pub fill_count: u64,

    /// Equity at the start of the current trading date.
    pub day_start_equity: f64,
    pub trading_date: String,
}

impl PaperAccount {
    pub fn from_config(cfg: &PaperAccountConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: cfg.id.clone(),
            broker_tag: cfg.broker_tag.clone(),
            mode: cfg.mode,
            initial_balance: cfg.initial_balance,
            balance: cfg.initial_balance,
            positions: HashMap::new(),
            total_realized: 0.0,
            total_commissions: 0.0,
            total_fees: 0.0,
            fill_count: 0,
            day_start_equity: cfg.initial_balance,
            trading_date: clock::trading_date(now),
        }
    }

    /// Roll the daily baseline when the trading date changes.
    pub fn maybe_roll_day(&mut self, now: DateTime<Utc>, marks: &HashMap<String, f64>) {
        let today = clock::trading_date(now);
        if today != self.trading_date {
            let equity = self.equity(marks);
            info!(
                account = %self.id,
                old_date = %self.trading_date,
                new_date = %today,
                equity,
                "paper account daily baseline rolled"
            );
            self.trading_date = today;
            self.day_start_equity = equity;
        }
    }

    /// Apply a fill: netting position math, realized P&L, and cost debits.
    pub fn apply_fill(&mut self, fill: &Fill, multiplier: f64) -> AppliedFill {
        let delta = fill.side.sign() * fill.qty;
        let pos = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| PaperPosition {
                symbol: fill.symbol.clone(),
                net_qty: 0.0,
                avg_entry: 0.0,
                multiplier,
                realized_pnl: 0.0,
            });

        let mut realized_delta = 0.0;
        let mut closed_qty = 0.0;

        if pos.net_qty == 0.0 || pos.net_qty.signum() == delta.signum() {
            // Opening or adding: weighted average entry.
            let total = pos.net_qty.abs() + fill.qty;
            pos.avg_entry =
                (pos.avg_entry * pos.net_qty.abs() + fill.price * fill.qty) / total;
            pos.net_qty += delta;
        } else {
            // Reducing or crossing through flat.
            closed_qty = fill.qty.min(pos.net_qty.abs());
            realized_delta =
                (fill.price - pos.avg_entry) * closed_qty * pos.multiplier * pos.net_qty.signum();
            pos.realized_pnl += realized_delta;
            pos.net_qty += delta;

            if pos.net_qty != 0.0 && pos.net_qty.signum() == delta.signum() {
                // Crossed through zero: the remainder opens at the fill price.
                pos.avg_entry = fill.price;
            } else if pos.net_qty == 0.0 {
                pos.avg_entry = 0.0;
            }
        }

        let net_qty_after = pos.net_qty;
        if pos.net_qty.abs() < 1e-12 && pos.realized_pnl == 0.0 {
            self.positions.remove(&fill.symbol);
        }

        self.balance += realized_delta - fill.commission - fill.fees;
        self.total_realized += realized_delta;
        self.total_commissions += fill.commission;
        self.total_fees += fill.fees;
        self.fill_count += 1;

        AppliedFill {
            realized_delta,
            closed_qty,
            net_qty_after,
        }
    }

    /// Unrealized P&L across all positions at the given marks. Positions
    /// without a mark contribute zero.
    pub fn unrealized(&self, marks: &HashMap<String, f64>) -> f64 {
        self.positions
            .values()
            .map(|p| marks.get(&p.symbol).map(|m| p.unrealized(*m)).unwrap_or(0.0))
            .sum()
    }

    pub fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        self.balance + self.unrealized(marks)
    }

    pub fn day_pnl(&self, marks: &HashMap<String, f64>) -> f64 {
        self.equity(marks) - self.day_start_equity
    }

    /// Signed net quantity in `symbol` (0.0 when flat).
    pub fn net_qty(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.net_qty).unwrap_or(0.0)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| p.net_qty != 0.0).count()
    }

    /// Verify the cash conservation invariant.
    pub fn check_conservation(&self) -> Result<(), String> {
        let expected =
            self.initial_balance + self.total_realized - self.total_commissions - self.total_fees;
        let drift = (self.balance - expected).abs();
        if drift > CASH_EPSILON {
            return Err(format!(
                "cash conservation breached on {}: balance {} expected {} (drift {})",
                self.id, self.balance, expected, drift
            ));
        }
        Ok(())
    }

    /// Restore the account to its configured starting state.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        info!(account = %self.id, "paper account reset");
        self.balance = self.initial_balance;
        self.positions.clear();
        self.total_realized = 0.0;
        self.total_commissions = 0.0;
        self.total_fees = 0.0;
        self.fill_count = 0;
        self.day_start_equity = self.initial_balance;
        self.trading_date = clock::trading_date(now);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{new_order, Fill};
    use crate::types::{OrderSide, OrderType};

    fn account() -> PaperAccount {
        PaperAccount::from_config(
            &PaperAccountConfig {
                id: "sim-001".into(),
                broker_tag: "simulator".into(),
                mode: PaperMode::Simulator,
                initial_balance: 100_000.0,
            },
            Utc::now(),
        )
    }

    fn fill(side: OrderSide, qty: f64, price: f64, commission: f64, fees: f64) -> Fill {
        let order = new_order(
            "a",
            "sim-001",
            "paper_simulator",
            "simulator",
            "ES",
            side,
            qty,
            OrderType::Market,
            None,
            None,
            None,
        );
        let mut f = Fill::new(&order, qty, price);
        f.commission = commission;
        f.fees = fees;
        f
    }

    #[test]
    fn open_and_close_realizes_pnl() {
        let mut acct = account();

        let applied = acct.apply_fill(&fill(OrderSide::Buy, 2.0, 5000.0, 4.5, 2.8), 50.0);
        assert_eq!(applied.realized_delta, 0.0);
        assert_eq!(applied.net_qty_after, 2.0);
        assert_eq!(acct.net_qty("ES"), 2.0);

        // Close both contracts 4 points higher: 2 * 4 * $50 = $400.
        let applied = acct.apply_fill(&fill(OrderSide::Sell, 2.0, 5004.0, 4.5, 2.8), 50.0);
        assert!((applied.realized_delta - 400.0).abs() < 1e-9);
        assert_eq!(applied.closed_qty, 2.0);
        assert_eq!(applied.net_qty_after, 0.0);

        // Balance = initial + 400 - 2*(4.5+2.8).
        assert!((acct.balance - (100_000.0 + 400.0 - 14.6)).abs() < 1e-9);
        acct.check_conservation().unwrap();
    }

    #[test]
    fn averaging_into_a_position() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Buy, 1.0, 5000.0, 0.0, 0.0), 50.0);
        acct.apply_fill(&fill(OrderSide::Buy, 1.0, 5010.0, 0.0, 0.0), 50.0);

        let pos = acct.positions.get("ES").unwrap();
        assert_eq!(pos.net_qty, 2.0);
        assert!((pos.avg_entry - 5005.0).abs() < 1e-9);
    }

    #[test]
    fn crossing_through_flat_reopens_at_fill_price() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Buy, 1.0, 5000.0, 0.0, 0.0), 50.0);

        // Sell 3: closes 1 long (+2 points) and opens 2 short at 5002.
        let applied = acct.apply_fill(&fill(OrderSide::Sell, 3.0, 5002.0, 0.0, 0.0), 50.0);
        assert!((applied.realized_delta - 100.0).abs() < 1e-9);
        assert_eq!(applied.closed_qty, 1.0);
        assert_eq!(applied.net_qty_after, -2.0);

        let pos = acct.positions.get("ES").unwrap();
        assert_eq!(pos.avg_entry, 5002.0);
        acct.check_conservation().unwrap();
    }

    #[test]
    fn short_positions_profit_when_price_falls() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Sell, 2.0, 5000.0, 0.0, 0.0), 50.0);
        let applied = acct.apply_fill(&fill(OrderSide::Buy, 2.0, 4990.0, 0.0, 0.0), 50.0);
        assert!((applied.realized_delta - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn unrealized_and_equity_follow_marks() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Buy, 1.0, 5000.0, 0.0, 0.0), 50.0);

        let marks = HashMap::from([("ES".to_string(), 5006.0)]);
        assert!((acct.unrealized(&marks) - 300.0).abs() < 1e-9);
        assert!((acct.equity(&marks) - 100_300.0).abs() < 1e-9);
        assert!((acct.day_pnl(&marks) - 300.0).abs() < 1e-9);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Buy, 2.0, 5000.0, 4.5, 2.8), 50.0);
        acct.reset(Utc::now());

        assert_eq!(acct.balance, 100_000.0);
        assert!(acct.positions.is_empty());
        assert_eq!(acct.fill_count, 0);
        acct.check_conservation().unwrap();
    }

    #[test]
    fn conservation_detects_drift() {
        let mut acct = account();
        acct.apply_fill(&fill(OrderSide::Buy, 1.0, 5000.0, 2.25, 1.4), 50.0);
        acct.check_conservation().unwrap();

        acct.balance += 10.0;
        assert!(acct.check_conservation().is_err());
    }
}
