//! Bar aggregation with per-price footprint.
//!
//! Ticks are bucketed by `floor(ts / interval)`. Exactly one bar is open per
//! instrument; it closes (and is returned, immutable) when a tick from a
//! later bucket arrives. The aggressor side of each trade is classified
//! against the best bid/ask captured with that tick:
//! price >= best ask => buy-initiated, price <= best bid => sell-initiated,
//! otherwise unknown (counts toward volume but not the buy/sell split or CVD).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Tick;

/// Buy/sell volume traded at one price bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FootprintCell {
    pub buy: u64,
    pub sell: u64,
}

/// One completed aggregation interval. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: String,
    /// Bucket start, epoch milliseconds.
    pub start_ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
    /// Per-price buy/sell volume, keyed by the price formatted to a fixed
    /// number of decimals so bins are stable across float noise.
    pub footprint: BTreeMap<String, FootprintCell>,
    /// Running cumulative volume delta at the moment this bar closed.
    pub cvd: i64,
    pub trade_count: u64,
}

impl Bar {
    pub fn delta(&self) -> i64 {
        self.buy_volume as i64 - self.sell_volume as i64
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Aggressor classification for one trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggressor {
    Buy,
    Sell,
    Unknown,
}

fn classify_aggressor(tick: &Tick) -> Aggressor {
    match (tick.best_bid(), tick.best_ask()) {
        (_, Some(ask)) if tick.price >= ask => Aggressor::Buy,
        (Some(bid), _) if tick.price <= bid => Aggressor::Sell,
        _ => Aggressor::Unknown,
    }
}

/// Builds fixed-interval OHLCV + footprint bars from ticks, one instrument.
#[derive(Debug)]
pub struct BarAggregator {
    instrument: String,
    interval_ms: i64,
    price_decimals: usize,
    current: Option<Bar>,
    /// Bucket index of the open bar.
    current_bucket: i64,
    /// Process-lifetime running state; reset is out of scope.
    cvd: i64,
    trade_volume_sum: u64,
    trade_count: u64,
    out_of_order: u64,
}

impl BarAggregator {
    pub fn new(instrument: &str, interval_sec: i64, price_decimals: usize) -> Self {
        Self {
            instrument: instrument.to_string(),
            interval_ms: interval_sec * 1000,
            price_decimals,
            current: None,
            current_bucket: 0,
            cvd: 0,
            trade_volume_sum: 0,
            trade_count: 0,
            out_of_order: 0,
        }
    }

    pub fn cvd(&self) -> i64 {
        self.cvd
    }

    pub fn average_trade_size(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.trade_volume_sum as f64 / self.trade_count as f64
        }
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// Clone of the in-progress bar, for the throttled observer stream.
    pub fn snapshot(&self) -> Option<Bar> {
        self.current.clone()
    }

    fn bucket_of(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.interval_ms)
    }

    fn price_bin(&self, price: f64) -> String {
        format!("{:.*}", self.price_decimals, price)
    }

    /// Process one tick. Returns the previously open bar when this tick
    /// starts a new interval; ticks for already-closed buckets are dropped.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Bar> {
        let bucket = self.bucket_of(tick.ts_ms);

        let closed = match self.current {
            Some(ref bar) => {
                if bucket < self.current_bucket {
                    self.out_of_order += 1;
                    debug!(
                        "dropping out-of-order tick for {} (bucket {} < open {})",
                        self.instrument, bucket, self.current_bucket
                    );
                    return None;
                }
                if bucket > self.current_bucket {
                    let finished = bar.clone();
                    self.start_bar(tick, bucket);
                    Some(finished)
                } else {
                    self.apply(tick);
                    None
                }
            }
            None => {
                self.start_bar(tick, bucket);
                None
            }
        };

        closed
    }

    fn start_bar(&mut self, tick: &Tick, bucket: i64) {
        self.current_bucket = bucket;
        self.current = Some(Bar {
            instrument: self.instrument.clone(),
            start_ts_ms: bucket * self.interval_ms,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: 0,
            buy_volume: 0,
            sell_volume: 0,
            footprint: BTreeMap::new(),
            cvd: self.cvd,
            trade_count: 0,
        });
        self.apply(tick);
    }

    fn apply(&mut self, tick: &Tick) {
        let aggressor = if tick.is_trade() {
            classify_aggressor(tick)
        } else {
            Aggressor::Unknown
        };
        let bin = self.price_bin(tick.price);

        let bar = self.current.as_mut().expect("open bar");
        bar.high = bar.high.max(tick.price);
        bar.low = bar.low.min(tick.price);
        bar.close = tick.price;

        if tick.is_trade() {
            bar.volume += tick.qty;
            bar.trade_count += 1;
            self.trade_volume_sum += tick.qty;
            self.trade_count += 1;

            let cell = bar.footprint.entry(bin).or_default();
            match aggressor {
                Aggressor::Buy => {
                    bar.buy_volume += tick.qty;
                    cell.buy += tick.qty;
                    self.cvd += tick.qty as i64;
                }
                Aggressor::Sell => {
                    bar.sell_volume += tick.qty;
                    cell.sell += tick.qty;
                    self.cvd -= tick.qty as i64;
                }
                Aggressor::Unknown => {}
            }
            bar.cvd = self.cvd;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DepthLevel;

    fn trade(ts_ms: i64, price: f64, qty: u64, bid: f64, ask: f64) -> Tick {
        Tick {
            instrument: "NIFTY-FUT".to_string(),
            price,
            qty,
            ts_ms,
            bids: vec![DepthLevel { price: bid, qty: 100 }],
            asks: vec![DepthLevel { price: ask, qty: 100 }],
        }
    }

    #[test]
    fn test_ohlcv_bounds() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        agg.on_tick(&trade(2_000, 103.0, 5, 102.5, 103.0));
        agg.on_tick(&trade(3_000, 98.0, 7, 98.0, 98.5));
        agg.on_tick(&trade(4_000, 101.0, 3, 100.5, 101.0));

        // Next-minute tick closes the bar.
        let bar = agg.on_tick(&trade(61_000, 102.0, 1, 101.5, 102.0)).unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(bar.volume, 25);
    }

    #[test]
    fn test_aggressor_split_and_cvd() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        // At the ask: buy-initiated.
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        // At the bid: sell-initiated.
        agg.on_tick(&trade(2_000, 99.5, 4, 99.5, 100.0));
        // Between bid and ask: unknown, volume only.
        agg.on_tick(&trade(3_000, 99.75, 6, 99.5, 100.0));

        let bar = agg.on_tick(&trade(61_000, 100.0, 1, 99.5, 100.0)).unwrap();
        assert_eq!(bar.buy_volume, 10);
        assert_eq!(bar.sell_volume, 4);
        assert_eq!(bar.volume, 20);
        assert_eq!(bar.delta(), 6);
        assert_eq!(bar.cvd, 6);
    }

    #[test]
    fn test_footprint_bins() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        agg.on_tick(&trade(2_000, 100.0, 5, 99.5, 100.0));
        agg.on_tick(&trade(3_000, 99.5, 8, 99.5, 100.0));

        let bar = agg.snapshot().unwrap();
        assert_eq!(bar.footprint.get("100.00").unwrap().buy, 15);
        assert_eq!(bar.footprint.get("99.50").unwrap().sell, 8);
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(61_000, 100.0, 10, 99.5, 100.0));
        // Bucket 0 is already closed relative to the open bucket 1.
        assert!(agg.on_tick(&trade(5_000, 101.0, 5, 100.5, 101.0)).is_none());
        assert_eq!(agg.out_of_order(), 1);
        // The open bar is untouched by the stale tick.
        assert_eq!(agg.snapshot().unwrap().volume, 10);
    }

    #[test]
    fn test_duplicate_timestamp_same_bucket() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        assert!(agg.on_tick(&trade(1_000, 100.5, 5, 100.0, 100.5)).is_none());
        assert_eq!(agg.snapshot().unwrap().volume, 15);
        assert_eq!(agg.out_of_order(), 0);
    }

    #[test]
    fn test_quote_only_updates_price_not_volume() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        agg.on_tick(&trade(2_000, 104.0, 0, 103.5, 104.0));

        let bar = agg.snapshot().unwrap();
        assert_eq!(bar.high, 104.0);
        assert_eq!(bar.volume, 10);
        assert_eq!(bar.trade_count, 1);
    }

    #[test]
    fn test_average_trade_size_runs_across_bars() {
        let mut agg = BarAggregator::new("NIFTY-FUT", 60, 2);
        agg.on_tick(&trade(1_000, 100.0, 10, 99.5, 100.0));
        agg.on_tick(&trade(61_000, 100.0, 20, 99.5, 100.0));
        agg.on_tick(&trade(121_000, 100.0, 30, 99.5, 100.0));
        assert_eq!(agg.average_trade_size(), 20.0);
    }
}
