// =============================================================================
// Quote Cache — last-known prices and short-horizon realized range
// =============================================================================
//
// The cache keeps the most recent quote per symbol plus a rolling 30-second
// price window. The window feeds the paper simulator's volatility multiplier;
// with no observations the multiplier is 1.0.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Horizon of the realized-range window.
const RANGE_WINDOW_SECS: i64 = 30;
/// Upper bound on the volatility multiplier.
const VOLATILITY_MULT_CAP: f64 = 3.0;

/// Most recent market observation for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub ts: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }
}

struct SymbolState {
    latest: Quote,
    /// (ts, price) observations inside the range window.
    window: VecDeque<(DateTime<Utc>, f64)>,
}

/// Read-mostly quote store shared between the simulator, router, and API.
pub struct QuoteCache {
    symbols: RwLock<HashMap<String, SymbolState>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Record a trade print (or mark) for `symbol`.
    pub fn apply_trade(&self, symbol: &str, price: f64, ts: DateTime<Utc>) {
        if !(price > 0.0) || !price.is_finite() {
            return;
        }
        let mut symbols = self.symbols.write();
        let state = symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState {
                latest: Quote {
                    symbol: symbol.to_string(),
                    bid: 0.0,
                    ask: 0.0,
                    last: price,
                    ts,
                },
                window: VecDeque::new(),
            });

        state.latest.last = price;
        state.latest.ts = ts;
        state.window.push_back((ts, price));
        Self::trim(&mut state.window, ts);
    }

    /// Record a top-of-book update for `symbol`.
    pub fn apply_quote(&self, symbol: &str, bid: f64, ask: f64, ts: DateTime<Utc>) {
        let mid = (bid + ask) / 2.0;
        if !(mid > 0.0) || !mid.is_finite() {
            return;
        }
        let mut symbols = self.symbols.write();
        let state = symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState {
                latest: Quote {
                    symbol: symbol.to_string(),
                    bid,
                    ask,
                    last: mid,
                    ts,
                },
                window: VecDeque::new(),
            });

        state.latest.bid = bid;
        state.latest.ask = ask;
        state.latest.ts = ts;
        if state.latest.last <= 0.0 {
            state.latest.last = mid;
        }
        state.window.push_back((ts, mid));
        Self::trim(&mut state.window, ts);
    }

    /// Latest quote for `symbol`, if any has been observed.
    pub fn latest(&self, symbol: &str) -> Option<Quote> {
        self.symbols.read().get(symbol).map(|s| s.latest.clone())
    }

    /// Volatility multiplier from the trailing 30-second observed range:
    /// 1.0 + (range / mid) scaled so a 1 % range doubles slippage, capped.
    /// Unknown symbols and empty windows return 1.0.
    pub fn volatility_mult(&self, symbol: &str, now: DateTime<Utc>) -> f64 {
        let symbols = self.symbols.read();
        let Some(state) = symbols.get(symbol) else {
            return 1.0;
        };

        let cutoff = now - Duration::seconds(RANGE_WINDOW_SECS);
        let mut low = f64::INFINITY;
        let mut high = f64::NEG_INFINITY;
        for (ts, price) in state.window.iter() {
            if *ts >= cutoff {
                low = low.min(*price);
                high = high.max(*price);
            }
        }

        if !low.is_finite() || !high.is_finite() || low <= 0.0 {
            return 1.0;
        }

        let mid = (low + high) / 2.0;
        let range_frac = (high - low) / mid;
        (1.0 + range_frac * 100.0).clamp(1.0, VOLATILITY_MULT_CAP)
    }

    /// Symbols currently tracked.
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().keys().cloned().collect()
    }

    fn trim(window: &mut VecDeque<(DateTime<Utc>, f64)>, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(RANGE_WINDOW_SECS);
        while window.front().is_some_and(|(ts, _)| *ts < cutoff) {
            window.pop_front();
        }
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteCache")
            .field("symbols", &self.symbols.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_718_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn latest_tracks_trades_and_quotes() {
        let cache = QuoteCache::new();
        cache.apply_trade("ES", 5000.0, ts(0));
        cache.apply_quote("ES", 4999.75, 5000.25, ts(1));

        let q = cache.latest("ES").unwrap();
        assert_eq!(q.last, 5000.0);
        assert_eq!(q.bid, 4999.75);
        assert_eq!(q.mid(), 5000.0);
        assert!(cache.latest("NQ").is_none());
    }

    #[test]
    fn volatility_defaults_to_one() {
        let cache = QuoteCache::new();
        assert_eq!(cache.volatility_mult("ES", ts(0)), 1.0);

        // A flat window is also 1.0.
        cache.apply_trade("ES", 5000.0, ts(0));
        cache.apply_trade("ES", 5000.0, ts(5));
        assert_eq!(cache.volatility_mult("ES", ts(6)), 1.0);
    }

    #[test]
    fn volatility_scales_with_range() {
        let cache = QuoteCache::new();
        cache.apply_trade("ES", 5000.0, ts(0));
        cache.apply_trade("ES", 5025.0, ts(10));

        // 25 points on ~5012.5 mid is ~0.5% -> mult ~1.5.
        let mult = cache.volatility_mult("ES", ts(12));
        assert!(mult > 1.4 && mult < 1.6, "mult = {mult}");

        // Extreme ranges clamp at the cap.
        cache.apply_trade("ES", 5500.0, ts(15));
        assert_eq!(cache.volatility_mult("ES", ts(16)), 3.0);
    }

    #[test]
    fn old_observations_age_out() {
        let cache = QuoteCache::new();
        cache.apply_trade("ES", 5000.0, ts(0));
        cache.apply_trade("ES", 5100.0, ts(5));
        // 60 s later both observations are stale; a fresh flat print rules.
        cache.apply_trade("ES", 5050.0, ts(65));
        assert_eq!(cache.volatility_mult("ES", ts(66)), 1.0);
    }
}
