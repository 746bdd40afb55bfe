// =============================================================================
// Simulator Cost Model — contract specs, slippage, commissions, fees
// =============================================================================
//
// Per-fill cost computation:
//
//   slippage_ticks = base_slippage(symbol)
//                  * liquidity_factor(session)
//                  * volatility_mult
//                  * sqrt(qty / avg_volume)
//   fill_price     = p_ref + side_sign * slippage_ticks * tick_size
//
// Commission is per-contract for futures and per-share (with a minimum) for
// equities; regulatory and exchange fees follow fixed schedules.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{AssetClass, OrderSide, TradingSession};

/// Static per-symbol contract parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    pub asset_class: AssetClass,
    /// Minimum price increment.
    pub tick_size: f64,
    /// Currency value of one full point per contract/share.
    pub multiplier: f64,
    /// Baseline slippage in ticks for an average-size order.
    pub base_slippage_ticks: f64,
    /// Order size that produces exactly the baseline slippage.
    pub avg_volume: f64,
}

impl ContractSpec {
    fn futures(symbol: &str, tick_size: f64, multiplier: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Futures,
            tick_size,
            multiplier,
            base_slippage_ticks: 0.5,
            avg_volume: 10.0,
        }
    }

    fn equity(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Equity,
            tick_size: 0.01,
            multiplier: 1.0,
            base_slippage_ticks: 1.0,
            avg_volume: 500.0,
        }
    }

    /// Notional value of `qty` units at `price`.
    pub fn notional(&self, qty: f64, price: f64) -> f64 {
        qty * price * self.multiplier
    }
}

// =============================================================================
// Fee schedules
// =============================================================================

/// Futures commission per contract per side.
const FUTURES_COMMISSION_PER_CONTRACT: f64 = 2.25;
/// Futures regulatory (NFA) fee per contract.
const FUTURES_REGULATORY_FEE: f64 = 0.02;
/// Futures exchange/clearing fee per contract.
const FUTURES_EXCHANGE_FEE: f64 = 1.38;

/// Equity commission per share.
const EQUITY_COMMISSION_PER_SHARE: f64 = 0.005;
/// Equity commission floor per order side.
const EQUITY_COMMISSION_MIN: f64 = 1.00;
/// Equity regulatory (TAF-style) fee per share.
const EQUITY_REGULATORY_FEE_PER_SHARE: f64 = 0.000166;

/// Session liquidity factors. Closed sessions never reach this table: the
/// matching engine queues those orders until the next session.
fn liquidity_factor(session: TradingSession) -> f64 {
    match session {
        TradingSession::Regular => 1.0,
        TradingSession::Extended => 2.5,
        TradingSession::Closed => f64::INFINITY,
    }
}

// =============================================================================
// Cost model
// =============================================================================

/// Symbol registry plus the per-fill cost math. Unknown symbols fall back to
/// a default spec for the configured asset class.
#[derive(Debug, Clone)]
pub struct CostModel {
    specs: Vec<ContractSpec>,
    default_asset_class: AssetClass,
}

impl CostModel {
    pub fn new(default_asset_class: AssetClass) -> Self {
        Self {
            specs: vec![
                ContractSpec::futures("ES", 0.25, 50.0),
                ContractSpec::futures("NQ", 0.25, 20.0),
                ContractSpec::futures("YM", 1.0, 5.0),
                ContractSpec::futures("RTY", 0.1, 50.0),
                ContractSpec::futures("CL", 0.01, 1000.0),
                ContractSpec::futures("GC", 0.1, 100.0),
                ContractSpec::futures("MES", 0.25, 5.0),
                ContractSpec::futures("MNQ", 0.25, 2.0),
            ],
            default_asset_class,
        }
    }

    /// Resolve the spec for `symbol`, synthesizing a default for unknowns.
    pub fn spec(&self, symbol: &str) -> ContractSpec {
        if let Some(s) = self.specs.iter().find(|s| s.symbol == symbol) {
            return s.clone();
        }
        match self.default_asset_class {
            AssetClass::Futures => ContractSpec::futures(symbol, 0.25, 50.0),
            AssetClass::Equity => ContractSpec::equity(symbol),
        }
    }

    /// Slippage in ticks for an order of `qty` under the given conditions.
    pub fn slippage_ticks(
        &self,
        spec: &ContractSpec,
        session: TradingSession,
        volatility_mult: f64,
        qty: f64,
    ) -> f64 {
        spec.base_slippage_ticks
            * liquidity_factor(session)
            * volatility_mult
            * (qty / spec.avg_volume).sqrt()
    }

    /// Fill price after applying slippage against the reference price.
    /// Slippage always moves against the taker: up for buys, down for sells.
    pub fn fill_price(
        &self,
        spec: &ContractSpec,
        session: TradingSession,
        volatility_mult: f64,
        side: OrderSide,
        qty: f64,
        p_ref: f64,
    ) -> (f64, f64) {
        let ticks = self.slippage_ticks(spec, session, volatility_mult, qty);
        let slippage = ticks * spec.tick_size;
        (p_ref + side.sign() * slippage, slippage)
    }

    /// Commission for one side of `qty` units.
    pub fn commission(&self, spec: &ContractSpec, qty: f64) -> f64 {
        match spec.asset_class {
            AssetClass::Futures => qty * FUTURES_COMMISSION_PER_CONTRACT,
            AssetClass::Equity => (qty * EQUITY_COMMISSION_PER_SHARE).max(EQUITY_COMMISSION_MIN),
        }
    }

    /// Regulatory plus exchange fees for one side of `qty` units.
    pub fn fees(&self, spec: &ContractSpec, qty: f64) -> f64 {
        match spec.asset_class {
            AssetClass::Futures => qty * (FUTURES_REGULATORY_FEE + FUTURES_EXCHANGE_FEE),
            AssetClass::Equity => qty * EQUITY_REGULATORY_FEE_PER_SHARE,
        }
    }

    /// Worst-case per-unit price concession used by the rule engine for
    /// projected-loss checks (regular-session liquidity assumed).
    pub fn worst_case_slippage(&self, symbol: &str, qty: f64) -> f64 {
        let spec = self.spec(symbol);
        let ticks = self.slippage_ticks(&spec, TradingSession::Extended, 2.0, qty.max(1.0));
        ticks * spec.tick_size
    }
}
