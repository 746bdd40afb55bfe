// =============================================================================
// Funded-Account Rule Engine — per-alert and per-fill rule enforcement
// =============================================================================
//
// The evaluation itself is a pure function over (account state, rules,
// proposed order, now); the manager wraps it with per-account bookkeeping,
// the append-only violation log, and the status machine:
//
//   active --violation--> violated --acknowledge--> paused --resume--> active
//
// A violated account refuses every order until a human acknowledges the
// violation. Daily counters reset when the UTC date rolls over.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock;
use crate::config::{AllowedWindow, FundedRules};
use crate::types::AccountStatus;

/// Blackout margin around configured news windows.
const NEWS_BLACKOUT_MARGIN_MINUTES: i64 = 2;
/// Fraction of the daily loss budget that triggers a warning annotation.
const DAILY_LOSS_WARN_FRACTION: f64 = 0.75;

// =============================================================================
// Evaluation types
// =============================================================================

/// Order facts the rule engine needs; the router assembles this from the
/// alert, the cost model, and current account state.
#[derive(Debug, Clone)]
pub struct ProposedOrder {
    pub symbol: String,
    pub qty: f64,
    /// Worst-case loss of the fill itself (slippage + costs), in currency.
    pub worst_case_loss: f64,
}

/// Outcome of evaluating one proposed order.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Ok,
    /// Proceed, but annotate the order.
    Warn(Vec<String>),
    /// Refuse the order; the account transitions to violated.
    Violate { rule: String, reason: String, limit: f64, observed: f64 },
}

/// Append-only violation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolation {
    pub account_id: String,
    #[serde(rename = "type")]
    pub violation_type: String,
    pub severity: String,
    pub limit: f64,
    pub observed: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

/// Mutable per-account tracking state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundedAccountState {
    pub account_id: String,
    pub status: AccountStatus,
    pub daily_pnl: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub open_positions: u32,
    pub trading_date: String,
}

impl FundedAccountState {
    fn new(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            status: AccountStatus::Active,
            daily_pnl: 0.0,
            equity: 0.0,
            peak_equity: 0.0,
            open_positions: 0,
            trading_date: clock::trading_date(now),
        }
    }
}

// =============================================================================
// Pure evaluation
// =============================================================================

/// Evaluate a proposed order against the rule set. First violation wins;
/// warnings accumulate.
pub fn evaluate(
    state: &FundedAccountState,
    rules: &FundedRules,
    order: &ProposedOrder,
    now: DateTime<Utc>,
) -> Evaluation {
    let mut warnings = Vec::new();

    // 1. Daily loss: projected P&L after a worst-case fill stays inside the
    //    budget.
    if rules.max_daily_loss > 0.0 {
        let projected = state.daily_pnl - order.worst_case_loss;
        if -projected > rules.max_daily_loss {
            return Evaluation::Violate {
                rule: "daily_loss_cap".into(),
                reason: format!(
                    "projected daily loss {:.2} exceeds cap {:.2}",
                    -projected, rules.max_daily_loss
                ),
                limit: rules.max_daily_loss,
                observed: -projected,
            };
        }
        if -state.daily_pnl >= rules.max_daily_loss * DAILY_LOSS_WARN_FRACTION {
            warnings.push(format!(
                "daily loss {:.2} is within 25% of the {:.2} cap",
                -state.daily_pnl, rules.max_daily_loss
            ));
        }
    }

    // 2. Trailing drawdown from peak equity.
    if rules.trailing_drawdown > 0.0 && state.peak_equity > 0.0 {
        let drawdown = state.peak_equity - state.equity;
        if drawdown > rules.trailing_drawdown {
            return Evaluation::Violate {
                rule: "trailing_drawdown".into(),
                reason: format!(
                    "drawdown {:.2} from peak exceeds limit {:.2}",
                    drawdown, rules.trailing_drawdown
                ),
                limit: rules.trailing_drawdown,
                observed: drawdown,
            };
        }
    }

    // 3. Contract cap: the router clamps oversize orders, so overage here is
    //    an annotation, not a refusal.
    if rules.max_contracts > 0.0 && order.qty > rules.max_contracts {
        warnings.push(format!(
            "quantity {} exceeds max_contracts {} and will be clamped",
            order.qty, rules.max_contracts
        ));
    }

    // 4. Concurrent position cap.
    if rules.max_concurrent_positions > 0
        && state.open_positions >= rules.max_concurrent_positions
    {
        return Evaluation::Violate {
            rule: "max_concurrent_positions".into(),
            reason: format!(
                "{} positions open, limit {}",
                state.open_positions, rules.max_concurrent_positions
            ),
            limit: rules.max_concurrent_positions as f64,
            observed: state.open_positions as f64,
        };
    }

    // 5. Allowed hours.
    if !rules.allowed_hours.is_empty() && !within_any_window(&rules.allowed_hours, now) {
        return Evaluation::Violate {
            rule: "outside_allowed_hours".into(),
            reason: format!("{} is outside every allowed trading window", now.format("%H:%M")),
            limit: 0.0,
            observed: 0.0,
        };
    }

    // 6. Symbol denylist.
    if rules
        .restricted_symbols
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&order.symbol))
    {
        return Evaluation::Violate {
            rule: "restricted_symbol".into(),
            reason: format!("{} is restricted for this account", order.symbol),
            limit: 0.0,
            observed: 0.0,
        };
    }

    // 7. News blackout.
    if rules.news_blackout {
        for window in &rules.news_windows {
            let start = window.start - chrono::Duration::minutes(NEWS_BLACKOUT_MARGIN_MINUTES);
            let end = window.end + chrono::Duration::minutes(NEWS_BLACKOUT_MARGIN_MINUTES);
            if now >= start && now <= end {
                return Evaluation::Violate {
                    rule: "news_blackout".into(),
                    reason: format!(
                        "inside news blackout window {} - {}",
                        window.start, window.end
                    ),
                    limit: 0.0,
                    observed: 0.0,
                };
            }
        }
    }

    if warnings.is_empty() {
        Evaluation::Ok
    } else {
        Evaluation::Warn(warnings)
    }
}

/// "HH:MM" daily windows; a window whose end precedes its start wraps
/// midnight.
fn within_any_window(windows: &[AllowedWindow], now: DateTime<Utc>) -> bool {
    let minute_of_day = now.hour() * 60 + now.minute();
    windows.iter().any(|w| {
        match (parse_hhmm(&w.start), parse_hhmm(&w.end)) {
            (Some(start), Some(end)) if start <= end => {
                (start..end).contains(&minute_of_day)
            }
            (Some(start), Some(end)) => minute_of_day >= start || minute_of_day < end,
            _ => {
                warn!(start = %w.start, end = %w.end, "unparseable allowed_hours window ignored");
                false
            }
        }
    })
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

// =============================================================================
// Manager
// =============================================================================

/// Per-account rule enforcement and violation bookkeeping.
pub struct FundedAccountManager {
    accounts: RwLock<HashMap<String, FundedAccountState>>,
    violations: RwLock<Vec<RiskViolation>>,
}

impl FundedAccountManager {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            violations: RwLock::new(Vec::new()),
        }
    }

    /// Current state for `account_id`, creating a fresh active record on
    /// first sight.
    pub fn state(&self, account_id: &str) -> FundedAccountState {
        let now = Utc::now();
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| FundedAccountState::new(account_id, now))
            .clone()
    }

    /// Gate + evaluate a proposed order. A violated/paused account refuses
    /// outright; an active account runs the rule set, and any violation is
    /// recorded and flips the account to violated.
    pub fn evaluate_order(
        &self,
        account_id: &str,
        rules: &FundedRules,
        order: &ProposedOrder,
        now: DateTime<Utc>,
    ) -> Evaluation {
        self.maybe_roll_day(account_id, now);

        let state = self.state(account_id);
        match state.status {
            AccountStatus::Violated => {
                return Evaluation::Violate {
                    rule: "account_violated".into(),
                    reason: "account is violated pending acknowledgement".into(),
                    limit: 0.0,
                    observed: 0.0,
                };
            }
            AccountStatus::Paused => {
                return Evaluation::Violate {
                    rule: "account_paused".into(),
                    reason: "account is paused".into(),
                    limit: 0.0,
                    observed: 0.0,
                };
            }
            AccountStatus::Active => {}
        }

        let evaluation = evaluate(&state, rules, order, now);
        if let Evaluation::Violate { rule, reason, limit, observed } = &evaluation {
            self.record_violation(account_id, rule, limit, observed, now);
            warn!(
                account = account_id,
                rule = %rule,
                reason = %reason,
                "funded-account rule violated — account locked"
            );
        }
        evaluation
    }

    /// Fold a fill's realized P&L and position change into the account.
    pub fn record_fill(
        &self,
        account_id: &str,
        realized_pnl: f64,
        costs: f64,
        open_positions: u32,
        now: DateTime<Utc>,
    ) {
        self.maybe_roll_day(account_id, now);
        let mut accounts = self.accounts.write();
        let state = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| FundedAccountState::new(account_id, now));
        state.daily_pnl += realized_pnl - costs;
        state.equity += realized_pnl - costs;
        if state.equity > state.peak_equity {
            state.peak_equity = state.equity;
        }
        state.open_positions = open_positions;
    }

    /// Refresh equity from a backend account snapshot (read-through cache).
    pub fn update_equity(&self, account_id: &str, equity: f64, open_positions: u32) {
        let now = Utc::now();
        let mut accounts = self.accounts.write();
        let state = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| FundedAccountState::new(account_id, now));
        state.equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        state.open_positions = open_positions;
    }

    /// Acknowledge the latest violation: violated -> paused.
    pub fn acknowledge(&self, account_id: &str) -> Result<FundedAccountState, String> {
        let mut accounts = self.accounts.write();
        let state = accounts
            .get_mut(account_id)
            .ok_or_else(|| format!("unknown funded account {account_id}"))?;
        if state.status != AccountStatus::Violated {
            return Err(format!(
                "account {account_id} is {} — nothing to acknowledge",
                state.status
            ));
        }
        state.status = AccountStatus::Paused;
        for v in self.violations.write().iter_mut() {
            if v.account_id == account_id {
                v.acknowledged = true;
            }
        }
        info!(account = account_id, "violation acknowledged — account paused");
        Ok(state.clone())
    }

    /// Operator pause: active -> paused.
    pub fn pause(&self, account_id: &str) -> FundedAccountState {
        let now = Utc::now();
        let mut accounts = self.accounts.write();
        let state = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| FundedAccountState::new(account_id, now));
        if state.status == AccountStatus::Active {
            state.status = AccountStatus::Paused;
            info!(account = account_id, "account paused");
        }
        state.clone()
    }

    /// Resume a paused account: paused -> active.
    pub fn resume(&self, account_id: &str) -> Result<FundedAccountState, String> {
        let mut accounts = self.accounts.write();
        let state = accounts
            .get_mut(account_id)
            .ok_or_else(|| format!("unknown funded account {account_id}"))?;
        match state.status {
            AccountStatus::Paused => {
                state.status = AccountStatus::Active;
                info!(account = account_id, "account resumed");
                Ok(state.clone())
            }
            AccountStatus::Violated => Err(format!(
                "account {account_id} is violated — acknowledge before resuming"
            )),
            AccountStatus::Active => Ok(state.clone()),
        }
    }

    pub fn violations(&self, account_id: Option<&str>) -> Vec<RiskViolation> {
        self.violations
            .read()
            .iter()
            .filter(|v| account_id.map_or(true, |a| v.account_id == a))
            .cloned()
            .collect()
    }

    /// Restore a violation record during startup replay.
    pub fn restore_violation(&self, violation: RiskViolation) {
        if !violation.acknowledged {
            let mut accounts = self.accounts.write();
            let state = accounts
                .entry(violation.account_id.clone())
                .or_insert_with(|| FundedAccountState::new(&violation.account_id, violation.ts));
            state.status = AccountStatus::Violated;
        }
        self.violations.write().push(violation);
    }

    pub fn all_states(&self) -> Vec<FundedAccountState> {
        self.accounts.read().values().cloned().collect()
    }

    fn record_violation(
        &self,
        account_id: &str,
        rule: &str,
        limit: &f64,
        observed: &f64,
        now: DateTime<Utc>,
    ) {
        self.violations.write().push(RiskViolation {
            account_id: account_id.to_string(),
            violation_type: rule.to_string(),
            severity: "violation".into(),
            limit: *limit,
            observed: *observed,
            ts: now,
            acknowledged: false,
        });
        if let Some(state) = self.accounts.write().get_mut(account_id) {
            state.status = AccountStatus::Violated;
        }
    }

    /// Reset daily counters when the UTC date rolls over.
    fn maybe_roll_day(&self, account_id: &str, now: DateTime<Utc>) {
        let today = clock::trading_date(now);
        let mut accounts = self.accounts.write();
        if let Some(state) = accounts.get_mut(account_id) {
            if state.trading_date != today {
                info!(
                    account = account_id,
                    old_date = %state.trading_date,
                    new_date = %today,
                    "funded account daily counters reset"
                );
                state.trading_date = today;
                state.daily_pnl = 0.0;
            }
        }
    }
}

impl Default for FundedAccountManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FundedAccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundedAccountManager")
            .field("accounts", &self.accounts.read().len())
            .field("violations", &self.violations.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 15, 0, 0).unwrap()
    }

    fn rules() -> FundedRules {
        FundedRules {
            max_daily_loss: 1000.0,
            trailing_drawdown: 2000.0,
            profit_target: 3000.0,
            max_contracts: 3.0,
            max_concurrent_positions: 2,
            allowed_hours: Vec::new(),
            restricted_symbols: vec!["BTC".into()],
            news_blackout: false,
            news_windows: Vec::new(),
        }
    }

    fn order(symbol: &str, qty: f64, worst_case: f64) -> ProposedOrder {
        ProposedOrder {
            symbol: symbol.into(),
            qty,
            worst_case_loss: worst_case,
        }
    }

    fn state_with(daily_pnl: f64) -> FundedAccountState {
        FundedAccountState {
            account_id: "TS50K001".into(),
            status: AccountStatus::Active,
            daily_pnl,
            equity: 50_000.0,
            peak_equity: 50_000.0,
            open_positions: 0,
            trading_date: clock::trading_date(now()),
        }
    }

    #[test]
    fn daily_loss_cap_blocks_worst_case_breach() {
        // -990 daily with a worst-case fill loss over $10 busts the $1000 cap.
        let ev = evaluate(&state_with(-990.0), &rules(), &order("ES", 1.0, 15.0), now());
        match ev {
            Evaluation::Violate { rule, observed, .. } => {
                assert_eq!(rule, "daily_loss_cap");
                assert!(observed > 1000.0);
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn near_cap_warns_but_proceeds() {
        let ev = evaluate(&state_with(-800.0), &rules(), &order("ES", 1.0, 5.0), now());
        assert!(matches!(ev, Evaluation::Warn(_)));
    }

    #[test]
    fn healthy_account_passes() {
        let ev = evaluate(&state_with(100.0), &rules(), &order("ES", 1.0, 5.0), now());
        assert_eq!(ev, Evaluation::Ok);
    }

    #[test]
    fn trailing_drawdown_violation() {
        let mut state = state_with(0.0);
        state.peak_equity = 53_000.0;
        state.equity = 50_500.0;
        let ev = evaluate(&state, &rules(), &order("ES", 1.0, 5.0), now());
        assert!(
            matches!(ev, Evaluation::Violate { ref rule, .. } if rule == "trailing_drawdown")
        );
    }

    #[test]
    fn oversize_order_warns_for_clamping() {
        let ev = evaluate(&state_with(0.0), &rules(), &order("ES", 5.0, 5.0), now());
        match ev {
            Evaluation::Warn(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("clamped")));
            }
            other => panic!("expected warn, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_position_cap() {
        let mut state = state_with(0.0);
        state.open_positions = 2;
        let ev = evaluate(&state, &rules(), &order("ES", 1.0, 5.0), now());
        assert!(
            matches!(ev, Evaluation::Violate { ref rule, .. } if rule == "max_concurrent_positions")
        );
    }

    #[test]
    fn restricted_symbol_is_refused() {
        let ev = evaluate(&state_with(0.0), &rules(), &order("btc", 1.0, 5.0), now());
        assert!(matches!(ev, Evaluation::Violate { ref rule, .. } if rule == "restricted_symbol"));
    }

    #[test]
    fn allowed_hours_enforced_with_midnight_wrap() {
        let mut r = rules();
        r.allowed_hours = vec![AllowedWindow {
            start: "13:30".into(),
            end: "20:00".into(),
        }];
        assert_eq!(
            evaluate(&state_with(0.0), &r, &order("ES", 1.0, 5.0), now()),
            Evaluation::Ok
        );

        let late = Utc.with_ymd_and_hms(2024, 6, 12, 22, 0, 0).unwrap();
        assert!(matches!(
            evaluate(&state_with(0.0), &r, &order("ES", 1.0, 5.0), late),
            Evaluation::Violate { ref rule, .. } if rule == "outside_allowed_hours"
        ));

        // Overnight window wraps midnight.
        r.allowed_hours = vec![AllowedWindow {
            start: "22:00".into(),
            end: "02:00".into(),
        }];
        let midnight = Utc.with_ymd_and_hms(2024, 6, 13, 0, 30, 0).unwrap();
        assert_eq!(
            evaluate(&state_with(0.0), &r, &order("ES", 1.0, 5.0), midnight),
            Evaluation::Ok
        );
    }

    #[test]
    fn news_blackout_includes_margin() {
        let mut r = rules();
        r.news_blackout = true;
        r.news_windows = vec![crate::config::NewsWindow {
            start: Utc.with_ymd_and_hms(2024, 6, 12, 14, 30, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 12, 14, 35, 0).unwrap(),
        }];

        // One minute before the window start is inside the +/- 2 min margin.
        let near = Utc.with_ymd_and_hms(2024, 6, 12, 14, 29, 0).unwrap();
        assert!(matches!(
            evaluate(&state_with(0.0), &r, &order("ES", 1.0, 5.0), near),
            Evaluation::Violate { ref rule, .. } if rule == "news_blackout"
        ));

        let clear = Utc.with_ymd_and_hms(2024, 6, 12, 14, 40, 0).unwrap();
        assert_eq!(
            evaluate(&state_with(0.0), &r, &order("ES", 1.0, 5.0), clear),
            Evaluation::Ok
        );
    }

    #[test]
    fn violation_locks_account_until_acknowledged() {
        let mgr = FundedAccountManager::new();
        mgr.update_equity("TS50K001", 50_000.0, 0);
        mgr.record_fill("TS50K001", -990.0, 0.0, 0, now());

        let ev = mgr.evaluate_order("TS50K001", &rules(), &order("ES", 1.0, 15.0), now());
        assert!(matches!(ev, Evaluation::Violate { ref rule, .. } if rule == "daily_loss_cap"));
        assert_eq!(mgr.state("TS50K001").status, AccountStatus::Violated);
        assert_eq!(mgr.violations(Some("TS50K001")).len(), 1);

        // Locked: even a tiny order is refused, without a second violation
        // record.
        let ev = mgr.evaluate_order("TS50K001", &rules(), &order("ES", 1.0, 0.1), now());
        assert!(matches!(ev, Evaluation::Violate { ref rule, .. } if rule == "account_violated"));
        assert_eq!(mgr.violations(Some("TS50K001")).len(), 1);

        // acknowledge -> paused -> resume -> active.
        assert_eq!(mgr.acknowledge("TS50K001").unwrap().status, AccountStatus::Paused);
        assert!(mgr.violations(Some("TS50K001"))[0].acknowledged);
        assert_eq!(mgr.resume("TS50K001").unwrap().status, AccountStatus::Active);
    }

    #[test]
    fn daily_counters_roll_over() {
        let mgr = FundedAccountManager::new();
        mgr.record_fill("acct", -500.0, 0.0, 0, now());
        assert_eq!(mgr.state("acct").daily_pnl, -500.0);

        let tomorrow = now() + chrono::Duration::days(1);
        let ev = mgr.evaluate_order("acct", &rules(), &order("ES", 1.0, 5.0), tomorrow);
        assert_eq!(ev, Evaluation::Ok);
        assert_eq!(mgr.state("acct").daily_pnl, 0.0);
    }
}
