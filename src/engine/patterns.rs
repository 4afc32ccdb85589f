//! Candlestick confirmation patterns.
//!
//! Pure geometric tests on OHLC of the two most recently closed bars.
//! Thresholds follow the common definitions: an engulfing body must cover
//! the prior body, and hammer/shooting-star wicks must be at least twice the
//! body with the opposite wick no larger than the body.

use super::bars::Bar;

fn body(bar: &Bar) -> f64 {
    (bar.close - bar.open).abs()
}

fn upper_wick(bar: &Bar) -> f64 {
    bar.high - bar.open.max(bar.close)
}

fn lower_wick(bar: &Bar) -> f64 {
    bar.open.min(bar.close) - bar.low
}

pub fn bullish_engulfing(prev: &Bar, last: &Bar) -> bool {
    prev.close < prev.open
        && last.close > last.open
        && last.open <= prev.close
        && last.close >= prev.open
        && body(last) > body(prev)
}

pub fn bearish_engulfing(prev: &Bar, last: &Bar) -> bool {
    prev.close > prev.open
        && last.close < last.open
        && last.open >= prev.close
        && last.close <= prev.open
        && body(last) > body(prev)
}

pub fn hammer(bar: &Bar) -> bool {
    let b = body(bar);
    b > 0.0 && lower_wick(bar) >= 2.0 * b && upper_wick(bar) <= b
}

pub fn shooting_star(bar: &Bar) -> bool {
    let b = body(bar);
    b > 0.0 && upper_wick(bar) >= 2.0 * b && lower_wick(bar) <= b
}

/// Bullish confirmation for buy candidates.
pub fn confirms_buy(prev: &Bar, last: &Bar) -> bool {
    bullish_engulfing(prev, last) || hammer(last)
}

/// Bearish confirmation for sell candidates.
pub fn confirms_sell(prev: &Bar, last: &Bar) -> bool {
    bearish_engulfing(prev, last) || shooting_star(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            instrument: "NIFTY-FUT".to_string(),
            start_ts_ms: 0,
            open,
            high,
            low,
            close,
            volume: 100,
            buy_volume: 50,
            sell_volume: 50,
            footprint: BTreeMap::new(),
            cvd: 0,
            trade_count: 10,
        }
    }

    #[test]
    fn test_bullish_engulfing() {
        let prev = bar(101.0, 101.5, 99.5, 100.0); // bearish
        let last = bar(99.8, 102.0, 99.5, 101.5); // engulfs prev body
        assert!(bullish_engulfing(&prev, &last));
        assert!(!bearish_engulfing(&prev, &last));
    }

    #[test]
    fn test_engulfing_needs_larger_body() {
        let prev = bar(101.0, 101.5, 99.5, 100.0);
        let small = bar(100.0, 101.0, 99.8, 100.4); // inside prev body
        assert!(!bullish_engulfing(&prev, &small));
    }

    #[test]
    fn test_hammer() {
        // Long lower wick, small body at the top of the range.
        let h = bar(100.0, 100.3, 97.0, 100.2);
        assert!(hammer(&h));
        assert!(!shooting_star(&h));
    }

    #[test]
    fn test_shooting_star() {
        let s = bar(100.0, 103.0, 99.9, 99.9);
        // Zero-body guard: close == low here but body must be positive.
        let s = Bar { close: 99.95, ..s };
        assert!(shooting_star(&s));
        assert!(!hammer(&s));
    }

    #[test]
    fn test_doji_confirms_nothing() {
        let prev = bar(100.0, 101.0, 99.0, 100.5);
        let doji = bar(100.0, 100.5, 99.5, 100.0);
        assert!(!confirms_buy(&prev, &doji));
        assert!(!confirms_sell(&prev, &doji));
    }
}
