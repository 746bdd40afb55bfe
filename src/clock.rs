// =============================================================================
// Clock — session classification and time helpers
// =============================================================================
//
// Session buckets drive the paper simulator's liquidity model:
//   regular  — full liquidity
//   extended — thinner book, wider effective spread
//   closed   — no matching; orders queue until the next session
//
// Exchange clocks use fixed UTC offsets (CT = UTC-6 for futures, ET = UTC-5
// for equities); no DST table is carried.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc, Weekday};

use crate::types::{AssetClass, TradingSession};

/// Central-time offset used for futures session boundaries.
const CT_OFFSET_SECS: i32 = -6 * 3600;
/// Eastern-time offset used for equity session boundaries.
const ET_OFFSET_SECS: i32 = -5 * 3600;

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// UTC calendar date string (YYYY-MM-DD), used for daily P&L baselines.
pub fn trading_date(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Classify `now` into a session bucket for the given asset class.
pub fn classify_session(asset_class: AssetClass, now: DateTime<Utc>) -> TradingSession {
    match asset_class {
        AssetClass::Futures => classify_futures(now),
        AssetClass::Equity => classify_equity(now),
    }
}

/// CME-style futures week: opens Sunday 17:00 CT, closes Friday 16:00 CT,
/// with a daily maintenance halt 16:00-17:00 CT. Regular hours are
/// 08:30-15:15 CT on weekdays; everything else inside the open week is
/// extended.
fn classify_futures(now: DateTime<Utc>) -> TradingSession {
    let ct = now.with_timezone(&offset(CT_OFFSET_SECS));
    let minutes = ct.hour() * 60 + ct.minute();

    match ct.weekday() {
        Weekday::Sat => TradingSession::Closed,
        Weekday::Sun => {
            if minutes >= 17 * 60 {
                TradingSession::Extended
            } else {
                TradingSession::Closed
            }
        }
        Weekday::Fri if minutes >= 16 * 60 => TradingSession::Closed,
        _ => {
            // Daily maintenance halt.
            if (16 * 60..17 * 60).contains(&minutes) {
                TradingSession::Closed
            } else if (8 * 60 + 30..15 * 60 + 15).contains(&minutes) {
                TradingSession::Regular
            } else {
                TradingSession::Extended
            }
        }
    }
}

/// US equity hours: regular 09:30-16:00 ET, pre-market 04:00-09:30, after
/// hours 16:00-20:00, weekdays only.
fn classify_equity(now: DateTime<Utc>) -> TradingSession {
    let et = now.with_timezone(&offset(ET_OFFSET_SECS));
    if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
        return TradingSession::Closed;
    }

    let minutes = et.hour() * 60 + et.minute();
    if (9 * 60 + 30..16 * 60).contains(&minutes) {
        TradingSession::Regular
    } else if (4 * 60..9 * 60 + 30).contains(&minutes) || (16 * 60..20 * 60).contains(&minutes) {
        TradingSession::Extended
    } else {
        TradingSession::Closed
    }
}

/// True when `ts` is within `window_minutes` of `now` in either direction.
/// Used for webhook replay rejection and news-blackout windows.
pub fn within_window(now: DateTime<Utc>, ts: DateTime<Utc>, window_minutes: i64) -> bool {
    let delta = now.signed_duration_since(ts);
    delta.abs() <= Duration::minutes(window_minutes)
}

fn offset(secs: i32) -> FixedOffset {
    // Offsets are compile-time constants well inside the valid range.
    FixedOffset::east_opt(secs).expect("offset within +/- 24h")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn futures_regular_hours_midweek() {
        // Wednesday 2024-06-12 10:00 CT == 16:00 UTC.
        let s = classify_session(AssetClass::Futures, utc(2024, 6, 12, 16, 0));
        assert_eq!(s, TradingSession::Regular);
    }

    #[test]
    fn futures_overnight_is_extended() {
        // Wednesday 02:00 CT == 08:00 UTC.
        let s = classify_session(AssetClass::Futures, utc(2024, 6, 12, 8, 0));
        assert_eq!(s, TradingSession::Extended);
    }

    #[test]
    fn futures_maintenance_halt_is_closed() {
        // Wednesday 16:30 CT == 22:30 UTC.
        let s = classify_session(AssetClass::Futures, utc(2024, 6, 12, 22, 30));
        assert_eq!(s, TradingSession::Closed);
    }

    #[test]
    fn futures_saturday_closed() {
        let s = classify_session(AssetClass::Futures, utc(2024, 6, 15, 15, 0));
        assert_eq!(s, TradingSession::Closed);
    }

    #[test]
    fn futures_sunday_reopen() {
        // Sunday 18:00 CT == Monday 00:00 UTC.
        let s = classify_session(AssetClass::Futures, utc(2024, 6, 17, 0, 0));
        assert_eq!(s, TradingSession::Extended);
    }

    #[test]
    fn equity_regular_and_extended() {
        // Wednesday 10:00 ET == 15:00 UTC.
        assert_eq!(
            classify_session(AssetClass::Equity, utc(2024, 6, 12, 15, 0)),
            TradingSession::Regular
        );
        // Wednesday 05:00 ET == 10:00 UTC (pre-market).
        assert_eq!(
            classify_session(AssetClass::Equity, utc(2024, 6, 12, 10, 0)),
            TradingSession::Extended
        );
        // Wednesday 22:00 ET == Thursday 03:00 UTC (overnight).
        assert_eq!(
            classify_session(AssetClass::Equity, utc(2024, 6, 13, 3, 0)),
            TradingSession::Closed
        );
    }

    #[test]
    fn replay_window_boundaries() {
        let now = utc(2024, 6, 12, 12, 0);
        assert!(within_window(now, utc(2024, 6, 12, 11, 56), 5));
        assert!(within_window(now, utc(2024, 6, 12, 12, 4), 5));
        assert!(!within_window(now, utc(2024, 6, 12, 11, 54), 5));
        assert!(!within_window(now, utc(2024, 6, 12, 12, 6), 5));
    }
}
